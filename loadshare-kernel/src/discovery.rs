/**
 * DISCOVERY ENGINE - Découverte non bloquante des bornes du groupe
 *
 * RÔLE :
 * Pilote une seule requête réseau asynchrone à la fois (primitive en deux
 * temps : start puis poll) et convertit ses résultats en liste de pairs
 * dédupliquée, conservée dans un cache à durée de vie bornée.
 *
 * FONCTIONNEMENT :
 * - IDLE → QUERYING → {COMPLETE, TIMED_OUT} → IDLE, relancé à chaque intervalle
 * - Poll court (≈100 ms) : le tick de la tâche ne bloque jamais
 * - Le handle de requête est possédé par l'état QUERYING et libéré une seule
 *   fois (fin normale, timeout ou shutdown) : `release` le consomme
 * - Le cache reste lisible (dernier résultat complet) pendant une requête
 *
 * DÉDUPLICATION :
 * Clé = hostname, dérivé de `<instance>.local`, sinon du hostname annoncé
 * normalisé en `.local`. Dans un même lot, le premier vu gagne.
 */

use crate::config::DiscoveryConf;
use crate::state::{new_state, DiscoveryTrigger, Shared};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("query primitive failed to start: {0}")]
    StartFailed(String),
    #[error("a query is already in flight")]
    Busy,
    #[error("no query in flight")]
    NotQuerying,
}

/// Handle opaque d'une requête en cours.
///
/// Ni `Clone` ni `Copy` : il n'existe qu'en un exemplaire, détenu par le
/// moteur, et `QueryPrimitive::release` le consomme.
#[derive(Debug, PartialEq, Eq)]
pub struct QueryHandle {
    id: u64,
}

impl QueryHandle {
    pub fn new(id: u64) -> Self {
        Self { id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpProtocol {
    V4,
    V6,
}

/// Paramètres passés à la primitive au démarrage d'une requête
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceQuery {
    pub service: String,
    pub protocol: String,
    pub ip_protocol: IpProtocol,
    pub timeout: Duration,
    pub max_results: usize,
}

impl ServiceQuery {
    pub fn from_config(cfg: &DiscoveryConf) -> Self {
        Self {
            service: cfg.service.clone(),
            protocol: cfg.protocol.clone(),
            ip_protocol: IpProtocol::V4,
            timeout: cfg.query_timeout(),
            max_results: cfg.max_results,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TxtEntry {
    pub key: Option<String>,
    pub value: Option<String>,
}

impl TxtEntry {
    pub fn new(key: &str, value: &str) -> Self {
        Self {
            key: Some(key.to_string()),
            value: Some(value.to_string()),
        }
    }
}

/// Une réponse brute de la primitive
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceRecord {
    pub instance_name: Option<String>,
    pub hostname: Option<String>,
    pub address: Option<Ipv4Addr>,
    pub port: u16,
    pub txt: Vec<TxtEntry>,
}

pub enum QueryPoll {
    Pending,
    Complete(Vec<ServiceRecord>),
}

/// Primitive de découverte de services (mDNS ou équivalent).
///
/// `poll` peut bloquer au plus `wait`. Les résultats rendus par `Complete`
/// appartiennent à l'appelant, la primitive n'a plus rien à libérer pour eux.
pub trait QueryPrimitive: Send {
    fn start(&mut self, query: &ServiceQuery) -> Result<QueryHandle, DiscoveryError>;
    fn poll(&mut self, handle: &mut QueryHandle, wait: Duration) -> QueryPoll;
    fn release(&mut self, handle: QueryHandle);
}

/// Pair découvert, après conversion et dédup
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveredPeer {
    pub hostname: String,
    pub service_name: String,
    pub ip_address: String,
    pub port: u16,
    pub txt_records: BTreeMap<String, String>,
    #[serde(with = "time::serde::rfc3339")]
    pub discovered_at: OffsetDateTime,
}

impl DiscoveredPeer {
    pub fn txt(&self, key: &str) -> Option<&str> {
        self.txt_records.get(key).map(String::as_str)
    }
}

/// Cache du dernier résultat complet
#[derive(Debug, Clone)]
pub struct PeerCache {
    peers: Vec<DiscoveredPeer>,
    captured_at: Option<Instant>,
    valid: bool,
    ttl: Duration,
}

impl PeerCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            peers: Vec::new(),
            captured_at: None,
            valid: false,
            ttl,
        }
    }

    pub fn store(&mut self, peers: Vec<DiscoveredPeer>, now: Instant) {
        self.peers = peers;
        self.captured_at = Some(now);
        self.valid = true;
    }

    /// Dernier résultat complet, éventuellement périmé
    pub fn peers(&self) -> &[DiscoveredPeer] {
        &self.peers
    }

    pub fn is_valid(&self, now: Instant) -> bool {
        match self.captured_at {
            Some(at) if self.valid => now.saturating_duration_since(at) < self.ttl,
            _ => false,
        }
    }

    /// Périme le cache sans vider la liste (périmé mais disponible)
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    pub fn time_remaining(&self, now: Instant) -> Duration {
        match self.captured_at {
            Some(at) if self.valid => self.ttl.saturating_sub(now.saturating_duration_since(at)),
            _ => Duration::ZERO,
        }
    }
}

enum QueryState {
    Idle,
    Querying { handle: QueryHandle, started_at: Instant },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Pending,
    Completed(usize),
    TimedOut,
}

/// Ce qui s'est passé pendant un tick du moteur
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Idle,
    Started,
    StartFailed,
    Pending,
    Completed(usize),
    TimedOut,
}

impl TickOutcome {
    /// Un cycle de découverte vient de se terminer (résultat ou timeout)
    pub fn cycle_ended(&self) -> bool {
        matches!(self, TickOutcome::Completed(_) | TickOutcome::TimedOut)
    }
}

/// Statistiques exposées par /system/health
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryStats {
    pub discovery_count: u64,
    pub last_result_count: usize,
    pub query_in_progress: bool,
}

pub struct DiscoveryEngine {
    primitive: Box<dyn QueryPrimitive>,
    query: ServiceQuery,
    discovery_interval: Duration,
    query_timeout: Duration,
    poll_wait: Duration,
    state: QueryState,
    cache: Shared<PeerCache>,
    stats: Shared<DiscoveryStats>,
    trigger: DiscoveryTrigger,
    last_query_at: Option<Instant>,
}

impl DiscoveryEngine {
    pub fn new(primitive: Box<dyn QueryPrimitive>, cfg: &DiscoveryConf, trigger: DiscoveryTrigger) -> Self {
        Self {
            primitive,
            query: ServiceQuery::from_config(cfg),
            discovery_interval: cfg.discovery_interval(),
            query_timeout: cfg.query_timeout(),
            poll_wait: cfg.poll_wait(),
            state: QueryState::Idle,
            cache: new_state(PeerCache::new(cfg.cache_ttl())),
            stats: new_state(DiscoveryStats::default()),
            trigger,
            last_query_at: None,
        }
    }

    /// Force une première découverte dès le prochain tick
    pub fn begin(&mut self) {
        self.last_query_at = None;
        self.cache.lock().invalidate();
        info!(service = %self.query.service, "background discovery started");
    }

    /// Libère la requête en vol, s'il y en a une
    pub fn shutdown(&mut self) {
        if self.release_in_flight() {
            info!("in-flight discovery query released on shutdown");
        }
    }

    pub fn is_querying(&self) -> bool {
        matches!(self.state, QueryState::Querying { .. })
    }

    pub fn trigger(&self) -> DiscoveryTrigger {
        self.trigger.clone()
    }

    /// Oublie l'instant de la dernière requête : la suivante part au prochain tick
    pub fn trigger_discovery(&self) {
        self.trigger.fire();
        debug!("manual discovery triggered");
    }

    pub fn cache(&self) -> Shared<PeerCache> {
        self.cache.clone()
    }

    pub fn stats_handle(&self) -> Shared<DiscoveryStats> {
        self.stats.clone()
    }

    pub fn stats(&self) -> DiscoveryStats {
        *self.stats.lock()
    }

    pub fn cached_peers(&self) -> Vec<DiscoveredPeer> {
        self.cache.lock().peers().to_vec()
    }

    pub fn is_cache_valid(&self, now: Instant) -> bool {
        self.cache.lock().is_valid(now)
    }

    pub fn invalidate_cache(&self) {
        self.cache.lock().invalidate();
        debug!("discovery cache invalidated");
    }

    pub fn cache_time_remaining(&self, now: Instant) -> Duration {
        self.cache.lock().time_remaining(now)
    }

    /// Un pas de la machine d'état
    pub fn tick(&mut self, now: Instant) -> TickOutcome {
        if self.is_querying() {
            return match self.poll_query(now) {
                Ok(PollOutcome::Pending) => TickOutcome::Pending,
                Ok(PollOutcome::Completed(n)) => TickOutcome::Completed(n),
                Ok(PollOutcome::TimedOut) => TickOutcome::TimedOut,
                Err(_) => TickOutcome::Idle,
            };
        }

        // le trigger n'est consommé qu'au repos : pendant une requête il reste armé
        let triggered = self.trigger.take();
        let due = triggered
            || match self.last_query_at {
                None => true,
                Some(at) => now.saturating_duration_since(at) >= self.discovery_interval,
            };
        if !due {
            return TickOutcome::Idle;
        }

        match self.start_query(now) {
            Ok(()) => TickOutcome::Started,
            Err(_) => TickOutcome::StartFailed,
        }
    }

    pub fn start_query(&mut self, now: Instant) -> Result<(), DiscoveryError> {
        if self.is_querying() {
            return Err(DiscoveryError::Busy);
        }

        match self.primitive.start(&self.query) {
            Ok(handle) => {
                self.state = QueryState::Querying { handle, started_at: now };
                self.last_query_at = Some(now);
                let mut stats = self.stats.lock();
                stats.discovery_count += 1;
                stats.query_in_progress = true;
                debug!(iteration = stats.discovery_count, "discovery query started");
                Ok(())
            }
            Err(e) => {
                // reste IDLE, nouvelle tentative au prochain tick
                warn!(error = %e, "failed to start discovery query");
                Err(e)
            }
        }
    }

    pub fn poll_query(&mut self, now: Instant) -> Result<PollOutcome, DiscoveryError> {
        let QueryState::Querying { handle, started_at } = &mut self.state else {
            return Err(DiscoveryError::NotQuerying);
        };
        let started_at = *started_at;

        match self.primitive.poll(handle, self.poll_wait) {
            QueryPoll::Complete(records) => {
                let elapsed = now.saturating_duration_since(started_at);
                let peers = records_to_peers(records, OffsetDateTime::now_utc());
                let count = peers.len();
                self.release_in_flight();
                self.cache.lock().store(peers, now);
                self.stats.lock().last_result_count = count;
                info!(peers = count, elapsed_ms = elapsed.as_millis() as u64, "discovery query complete");
                Ok(PollOutcome::Completed(count))
            }
            QueryPoll::Pending => {
                let elapsed = now.saturating_duration_since(started_at);
                if elapsed > self.query_timeout {
                    self.release_in_flight();
                    warn!(timeout_ms = self.query_timeout.as_millis() as u64, "discovery query timed out");
                    return Ok(PollOutcome::TimedOut);
                }
                Ok(PollOutcome::Pending)
            }
        }
    }

    /// Seul chemin qui rend un handle à la primitive
    fn release_in_flight(&mut self) -> bool {
        match std::mem::replace(&mut self.state, QueryState::Idle) {
            QueryState::Querying { handle, .. } => {
                self.primitive.release(handle);
                self.stats.lock().query_in_progress = false;
                true
            }
            QueryState::Idle => false,
        }
    }
}

impl Drop for DiscoveryEngine {
    fn drop(&mut self) {
        self.release_in_flight();
    }
}

fn non_empty(s: &Option<String>) -> Option<&str> {
    s.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Clé d'identité d'un enregistrement : (hostname, service_name)
fn derive_hostname(record: &ServiceRecord) -> Option<(String, String)> {
    if let Some(instance) = non_empty(&record.instance_name) {
        return Some((format!("{instance}.local"), instance.to_string()));
    }
    if let Some(raw) = non_empty(&record.hostname) {
        let hostname = if raw.ends_with(".local") {
            raw.to_string()
        } else {
            format!("{raw}.local")
        };
        return Some((hostname, raw.to_string()));
    }
    None
}

/// Convertit un lot de résultats ; premier vu gagne, sans hostname = ignoré
pub fn records_to_peers(records: Vec<ServiceRecord>, now: OffsetDateTime) -> Vec<DiscoveredPeer> {
    let mut peers: Vec<DiscoveredPeer> = Vec::with_capacity(records.len());

    for record in records {
        let Some((hostname, service_name)) = derive_hostname(&record) else {
            debug!("skipping discovery record without hostname");
            continue;
        };
        if peers.iter().any(|p| p.hostname == hostname) {
            continue;
        }

        let txt_records = record
            .txt
            .into_iter()
            .filter_map(|entry| match (entry.key, entry.value) {
                (Some(k), Some(v)) => Some((k, v)),
                _ => None,
            })
            .collect();

        debug!(host = %hostname, port = record.port, "found peer");
        peers.push(DiscoveredPeer {
            hostname,
            service_name,
            ip_address: record.address.map(|a| a.to_string()).unwrap_or_default(),
            port: record.port,
            txt_records,
            discovered_at: now,
        });
    }

    peers
}
