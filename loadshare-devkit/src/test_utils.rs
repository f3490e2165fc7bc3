/*!
Test Harness pour le coordinateur de partage de charge

Facilite l'écriture de scénarios avec :
- Primitive de découverte scriptée, stockage en mémoire, statuts statiques
- Horloge simulée (ticks sans attente réelle)
- Assertions sur l'état du groupe (budget, allocations, fuites de handles)
*/

use crate::query_stub::ScriptedQuery;
use crate::store_stub::{MemoryStore, StaticStatusSource};
use anyhow::Result;
use loadshare_kernel::config::LoadShareConfig;
use loadshare_kernel::coordinator::{Coordinator, CoordinatorHandle};
use loadshare_kernel::discovery::TickOutcome;
use loadshare_kernel::group::GroupStore;
use loadshare_kernel::models::{AllocationReason, GroupState};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

pub const PEERS_FILE: &str = "loadsharing_peers.json";

/// Tolérance des comparaisons de courant (A)
pub const EPSILON: f64 = 1e-9;

/// Harness de test complet pour le coordinateur
pub struct TestHarness {
    pub coordinator: Coordinator,
    pub handle: CoordinatorHandle,
    pub query: ScriptedQuery,
    pub store: MemoryStore,
    pub status: StaticStatusSource,
    pub group: Arc<GroupStore>,
    pub config: LoadShareConfig,
    origin: Instant,
    elapsed: Duration,
}

/// Config d'un groupe actif dont l'unité locale est `local_id`.local
pub fn group_config(max_current: f64, safety_factor: f64, local_id: &str) -> LoadShareConfig {
    let mut cfg = LoadShareConfig::default();
    cfg.group.enabled = true;
    cfg.group.group_id = "garage".into();
    cfg.group.max_current = max_current;
    cfg.group.safety_factor = safety_factor;
    cfg.local.id = local_id.into();
    cfg.local.host = format!("{local_id}.local");
    cfg
}

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .try_init()
        .ok();
}

impl TestHarness {
    /// Crée un harness avec une primitive vide (requêtes jamais terminées)
    pub fn new(config: LoadShareConfig) -> Self {
        Self::build(config, ScriptedQuery::new(), MemoryStore::new())
    }

    /// Chaque requête de découverte se termine au premier poll avec `query`
    pub fn with_query(config: LoadShareConfig, query: ScriptedQuery) -> Self {
        Self::build(config, query, MemoryStore::new())
    }

    pub fn build(config: LoadShareConfig, query: ScriptedQuery, store: MemoryStore) -> Self {
        init_tracing();
        let status = StaticStatusSource::new();
        let group = Arc::new(GroupStore::new(PathBuf::from(PEERS_FILE), Box::new(store.clone())));
        if let Err(e) = group.load() {
            tracing::warn!(error = %e, "harness: group file not loaded");
        }
        let coordinator = Coordinator::new(&config, Box::new(query.clone()), group.clone(), Arc::new(status.clone()));
        let handle = coordinator.handle();

        Self {
            coordinator,
            handle,
            query,
            store,
            status,
            group,
            config,
            origin: Instant::now(),
            elapsed: Duration::ZERO,
        }
    }

    pub fn now(&self) -> Instant {
        self.origin + self.elapsed
    }

    pub fn advance(&mut self, by: Duration) {
        self.elapsed += by;
    }

    /// Un tick à l'instant simulé courant, puis avance d'un intervalle de poll
    pub fn tick(&mut self) -> TickOutcome {
        let outcome = self.coordinator.tick(self.now(), OffsetDateTime::now_utc());
        self.advance(self.config.discovery.poll_interval());
        outcome
    }

    pub fn ticks(&mut self, count: usize) -> Vec<TickOutcome> {
        (0..count).map(|_| self.tick()).collect()
    }

    /// Tick jusqu'à la fin d'un cycle de découverte (résultat ou timeout)
    pub fn run_cycle(&mut self, max_ticks: usize) -> Result<TickOutcome> {
        for _ in 0..max_ticks {
            let outcome = self.tick();
            if outcome.cycle_ended() {
                return Ok(outcome);
            }
        }
        anyhow::bail!("no discovery cycle ended within {max_ticks} ticks");
    }

    pub fn state(&self) -> GroupState {
        self.handle.group_state()
    }

    pub fn state_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self.state())?)
    }

    /// Vérifie sum(target_current) <= max_current * safety_factor
    pub fn assert_budget(&self) -> Result<()> {
        let state = self.state();
        let total = state.total_allocated();
        if total > state.budget() {
            anyhow::bail!("budget exceeded: {total} A allocated for {} A", state.budget());
        }
        if state.online_count + state.offline_count != state.peers.len() {
            anyhow::bail!(
                "peer counts inconsistent: {} online + {} offline != {}",
                state.online_count,
                state.offline_count,
                state.peers.len()
            );
        }
        Ok(())
    }

    pub fn assert_allocation(&self, id: &str, target: f64, reason: AllocationReason) -> Result<()> {
        let state = self.state();
        let Some(allocation) = state.allocation(id) else {
            anyhow::bail!("no allocation for {id}");
        };
        if (allocation.target_current - target).abs() > EPSILON || allocation.reason != reason {
            anyhow::bail!(
                "allocation mismatch for {id}: expected {target} A ({reason:?}), got {} A ({:?})",
                allocation.target_current,
                allocation.reason
            );
        }
        Ok(())
    }

    /// Aucun handle libéré deux fois ni interrogé après libération
    pub fn assert_handles_clean(&self) -> Result<()> {
        if self.query.double_releases() > 0 {
            anyhow::bail!("{} double release(s)", self.query.double_releases());
        }
        if self.query.polls_after_release() > 0 {
            anyhow::bail!("{} poll(s) after release", self.query.polls_after_release());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_stub::unit_record;

    #[test]
    fn test_harness_clock_advances_per_tick() {
        let mut harness = TestHarness::new(group_config(32.0, 1.0, "a"));
        let start = harness.now();
        harness.tick();
        assert_eq!(harness.now() - start, harness.config.discovery.poll_interval());
    }

    #[test]
    fn test_run_cycle_completes() {
        let query = ScriptedQuery::always(vec![unit_record("b", [10, 0, 0, 2], &[])]);
        let mut harness = TestHarness::with_query(group_config(32.0, 1.0, "a"), query);
        assert_eq!(harness.run_cycle(3).unwrap(), TickOutcome::Completed(1));
        harness.assert_budget().unwrap();
        harness.assert_handles_clean().unwrap();
        assert_eq!(harness.state_json().unwrap()["group_id"], "garage");
    }
}
