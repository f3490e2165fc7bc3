/**
 * COORDINATEUR - Tâche unique qui fait avancer tout le pipeline
 *
 * PAR TICK (intervalle court, ou réveil par déclenchement manuel) :
 * 1. Machine d'état de découverte (start / poll / timeout)
 * 2. Sauvegarde de la liste du groupe si modifiée (coalescée)
 * 3. Rafraîchissement du registre (cache + groupe) et des statuts
 * 4. Compteur failsafe puis recalcul complet des allocations
 * 5. Publication de l'état pour les lecteurs (API)
 *
 * Tout l'état mutable du moteur appartient à `Coordinator` ; les handlers
 * HTTP passent par un `CoordinatorHandle` clonable.
 */

use crate::allocation::{AllocationEngine, FailsafeMonitor};
use crate::config::LoadShareConfig;
use crate::discovery::{DiscoveryEngine, DiscoveryStats, PeerCache, QueryPrimitive, TickOutcome};
use crate::group::{GroupError, GroupStore};
use crate::health::{CoordinatorHealth, HealthTracker};
use crate::models::GroupState;
use crate::registry::{all_peers, PeerInfo, PeerRegistry};
use crate::state::{new_state, DiscoveryTrigger, Shared};
use crate::status::StatusSource;
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

pub struct Coordinator {
    engine: DiscoveryEngine,
    group: Arc<GroupStore>,
    status: Arc<dyn StatusSource>,
    registry: PeerRegistry,
    allocator: AllocationEngine,
    failsafe: FailsafeMonitor,
    state: Shared<GroupState>,
    health: HealthTracker,
    poll_interval: Duration,
}

impl Coordinator {
    pub fn new(
        cfg: &LoadShareConfig,
        primitive: Box<dyn QueryPrimitive>,
        group: Arc<GroupStore>,
        status: Arc<dyn StatusSource>,
    ) -> Self {
        let engine = DiscoveryEngine::new(primitive, &cfg.discovery, DiscoveryTrigger::new());
        let allocator = AllocationEngine::new(cfg.group.clone(), &cfg.local);
        let state = new_state(GroupState {
            enabled: cfg.group.enabled,
            group_id: cfg.group.group_id.clone(),
            group_max_current: cfg.group.max_current,
            safety_factor: cfg.group.safety_factor,
            ..Default::default()
        });

        Self {
            engine,
            group,
            status,
            registry: PeerRegistry::new(cfg.local.id.clone(), cfg.local.host.clone()),
            allocator,
            failsafe: FailsafeMonitor::new(cfg.group.failsafe_missed_ticks),
            state,
            health: HealthTracker::new(),
            poll_interval: cfg.discovery.poll_interval(),
        }
    }

    pub fn handle(&self) -> CoordinatorHandle {
        CoordinatorHandle {
            group: self.group.clone(),
            cache: self.engine.cache(),
            stats: self.engine.stats_handle(),
            state: self.state.clone(),
            trigger: self.engine.trigger(),
            health: self.health.clone(),
        }
    }

    pub fn engine(&self) -> &DiscoveryEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut DiscoveryEngine {
        &mut self.engine
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn missed_ticks(&self) -> u32 {
        self.failsafe.missed()
    }

    pub fn begin(&mut self) {
        self.engine.begin();
    }

    pub fn shutdown(&mut self) {
        self.engine.shutdown();
        self.group.flush();
    }

    /// Un tour complet du pipeline ; ne bloque jamais plus que le poll de la primitive
    pub fn tick(&mut self, now: Instant, wall: OffsetDateTime) -> TickOutcome {
        let outcome = self.engine.tick(now);
        self.group.flush();

        let discovered = {
            let cache = self.engine.cache();
            let cache = cache.lock();
            if cache.is_valid(now) {
                cache.peers().to_vec()
            } else {
                Vec::new()
            }
        };
        let joined = self.group.list();
        self.registry.refresh(&discovered, &joined, wall);

        for peer in self.registry.peers_mut().iter_mut().filter(|p| p.online) {
            match self.status.peer_status(peer) {
                Ok(status) => peer.status = status,
                Err(e) => {
                    // sans statut le pair est traité comme non demandeur
                    debug!(peer = %peer.id, error = %e, "no status this cycle");
                    peer.status = Default::default();
                }
            }
        }

        let failsafe = if self.allocator.group().enabled {
            let visible = !discovered.is_empty() && self.registry.remote_online() > 0;
            let tripped = self.failsafe.observe(visible);
            if tripped && self.failsafe.missed() == self.allocator.group().failsafe_missed_ticks + 1 {
                info!(missed = self.failsafe.missed(), "no peer visible, entering failsafe");
            }
            tripped
        } else {
            self.failsafe.reset();
            false
        };

        let state = self.allocator.compute(self.registry.peers(), failsafe, wall);
        if outcome.cycle_ended() {
            info!(
                peers = state.peers.len(),
                online = state.online_count,
                allocated = state.total_allocated(),
                "group state recomputed"
            );
        }
        *self.state.lock() = state;
        outcome
    }

    fn tick_now(&mut self) -> TickOutcome {
        let now = Instant::now();
        let wall = OffsetDateTime::now_utc();
        match Handle::try_current().map(|h| h.runtime_flavor()) {
            Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(|| self.tick(now, wall)),
            _ => self.tick(now, wall),
        }
    }

    /// Boucle de la tâche : intervalle fixe, réveil immédiat sur trigger
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        self.begin();
        let trigger = self.engine.trigger();
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = self.poll_interval.as_millis() as u64, "coordinator started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = trigger.notified() => debug!("woken by discovery trigger"),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            self.tick_now();
        }

        self.shutdown();
        info!("coordinator stopped");
    }
}

/// Accès concurrent à l'état du coordinateur, pour l'API
#[derive(Clone)]
pub struct CoordinatorHandle {
    group: Arc<GroupStore>,
    cache: Shared<PeerCache>,
    stats: Shared<DiscoveryStats>,
    state: Shared<GroupState>,
    trigger: DiscoveryTrigger,
    health: HealthTracker,
}

impl CoordinatorHandle {
    pub fn join(&self, host: &str) -> Result<String, GroupError> {
        let host = crate::group::validate_host(host)?;
        self.group.add(&host)?;
        Ok(host)
    }

    pub fn leave(&self, host: &str) -> Result<(), GroupError> {
        self.group.remove(host.trim())
    }

    pub fn group_members(&self) -> Vec<String> {
        self.group.list()
    }

    /// Vue fusionnée ; les ids stables du registre priment quand ils sont connus
    pub fn peers(&self, include_discovered: bool, include_group: bool) -> Vec<PeerInfo> {
        let discovered = {
            let cache = self.cache.lock();
            if cache.is_valid(Instant::now()) {
                cache.peers().to_vec()
            } else {
                Vec::new()
            }
        };
        let mut peers = all_peers(&discovered, &self.group.list(), include_discovered, include_group);

        let state = self.state.lock();
        for info in peers.iter_mut() {
            if let Some(known) = state.peer_by_host(&info.host) {
                info.id = known.id.clone();
            }
        }
        peers
    }

    pub fn trigger_discovery(&self) {
        self.trigger.fire();
    }

    pub fn group_state(&self) -> GroupState {
        self.state.lock().clone()
    }

    pub fn state(&self) -> Shared<GroupState> {
        self.state.clone()
    }

    pub fn discovery_stats(&self) -> DiscoveryStats {
        *self.stats.lock()
    }

    pub fn health(&self) -> CoordinatorHealth {
        self.health
            .get_health(&self.stats, &self.cache, &self.state, self.group.len())
    }
}
