use crate::discovery::{DiscoveryStats, PeerCache};
use crate::models::GroupState;
use crate::state::Shared;
use serde::{Deserialize, Serialize};
use std::time::Instant;

#[derive(Debug, Serialize, Deserialize)]
pub struct CoordinatorHealth {
    pub uptime_seconds: u64,
    pub discovery_count: u64,
    pub last_result_count: usize,
    pub query_in_progress: bool,
    pub cache_valid: bool,
    pub cache_time_remaining_ms: u64,
    pub cached_peers: usize,
    pub group_members: usize,
    pub failsafe_active: bool,
    pub memory_usage_mb: f32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self { start_time: Instant::now() }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn get_health(
        &self,
        stats: &Shared<DiscoveryStats>,
        cache: &Shared<PeerCache>,
        state: &Shared<GroupState>,
        group_members: usize,
    ) -> CoordinatorHealth {
        let stats = *stats.lock();
        let now = Instant::now();
        let (cache_valid, remaining, cached_peers) = {
            let cache = cache.lock();
            (cache.is_valid(now), cache.time_remaining(now), cache.peers().len())
        };

        CoordinatorHealth {
            uptime_seconds: self.uptime_seconds(),
            discovery_count: stats.discovery_count,
            last_result_count: stats.last_result_count,
            query_in_progress: stats.query_in_progress,
            cache_valid,
            cache_time_remaining_ms: remaining.as_millis() as u64,
            cached_peers,
            group_members,
            failsafe_active: state.lock().failsafe_active,
            memory_usage_mb: get_memory_usage_mb(),
        }
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let rss_kb = status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = rss_kb {
                return kb as f32 / 1024.0;
            }
        }
    }
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::new_state;
    use std::time::Duration;

    #[test]
    fn test_health_reflects_cache_and_stats() {
        let tracker = HealthTracker::new();
        let stats = new_state(DiscoveryStats {
            discovery_count: 4,
            last_result_count: 2,
            query_in_progress: true,
        });
        let cache = new_state(PeerCache::new(Duration::from_secs(60)));
        let state = new_state(GroupState {
            failsafe_active: true,
            ..Default::default()
        });

        let health = tracker.get_health(&stats, &cache, &state, 3);
        assert_eq!(health.discovery_count, 4);
        assert_eq!(health.last_result_count, 2);
        assert!(health.query_in_progress);
        assert!(!health.cache_valid);
        assert_eq!(health.cache_time_remaining_ms, 0);
        assert_eq!(health.group_members, 3);
        assert!(health.failsafe_active);

        cache.lock().store(Vec::new(), Instant::now());
        let health = tracker.get_health(&stats, &cache, &state, 3);
        assert!(health.cache_valid);
        assert!(health.cache_time_remaining_ms > 0);
    }
}
