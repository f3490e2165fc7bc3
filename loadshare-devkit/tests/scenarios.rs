use loadshare_devkit::{
    charging_status, group_config, idle_status, unit_record, MemoryStore, ScriptedQuery, Step, StoreOp, TestHarness,
};
use loadshare_kernel::allocation::AllocationEngine;
use loadshare_kernel::config::LocalConf;
use loadshare_kernel::discovery::TickOutcome;
use loadshare_kernel::models::{evse_state, AllocationReason, Peer, PeerStatus};
use std::path::PathBuf;
use std::time::Duration;
use time::OffsetDateTime;

fn trio() -> ScriptedQuery {
    ScriptedQuery::always(vec![
        unit_record("a", [10, 0, 0, 1], &[]),
        unit_record("b", [10, 0, 0, 2], &[]),
        unit_record("c", [10, 0, 0, 3], &[]),
    ])
}

#[test]
fn equal_share_across_three_charging_units() {
    let mut harness = TestHarness::with_query(group_config(32.0, 0.9, "a"), trio());
    for id in ["a", "b", "c"] {
        harness.status.set_charging(id);
    }

    assert_eq!(harness.run_cycle(3).unwrap(), TickOutcome::Completed(3));
    harness.tick();

    for id in ["a", "b", "c"] {
        harness.assert_allocation(id, 9.6, AllocationReason::EqualShare).unwrap();
    }
    let state = harness.state();
    assert!(state.total_allocated() <= 28.8 + 1e-12);
    assert!(state.config_consistent);
    assert!(!state.failsafe_active);
    assert_eq!(state.online_count, 3);
    harness.assert_budget().unwrap();
}

#[test]
fn joined_host_is_listed_offline_immediately() {
    let harness = TestHarness::new(group_config(32.0, 1.0, "a"));
    harness.handle.join("b.local").unwrap();

    let peers = harness.handle.peers(true, true);
    let b = peers.iter().find(|p| p.host == "b.local").unwrap();
    assert!(b.joined);
    assert!(!b.online);
    assert_eq!(b.ip, "");
}

#[test]
fn timed_out_query_keeps_previous_cache() {
    let query = ScriptedQuery::new();
    query.push(Step::Complete(vec![unit_record("b", [10, 0, 0, 2], &[])]));
    let mut harness = TestHarness::with_query(group_config(32.0, 1.0, "a"), query);

    assert_eq!(harness.run_cycle(3).unwrap(), TickOutcome::Completed(1));
    let before = harness.handle.peers(true, false);
    assert_eq!(before.len(), 1);

    // nouvelle requête qui ne se termine jamais
    harness.handle.trigger_discovery();
    assert_eq!(harness.tick(), TickOutcome::Started);
    assert!(harness.handle.discovery_stats().query_in_progress);
    assert_eq!(harness.run_cycle(5).unwrap(), TickOutcome::TimedOut);

    assert!(!harness.handle.discovery_stats().query_in_progress);
    assert_eq!(harness.handle.peers(true, false), before);
    assert_eq!(harness.query.released(), vec![1, 2]);
    assert_eq!(harness.query.outstanding(), 0);
    harness.assert_handles_clean().unwrap();
}

#[test]
fn ceiling_below_share_redistributes_remainder() {
    let query = ScriptedQuery::always(vec![unit_record("a", [10, 0, 0, 1], &[]), unit_record("b", [10, 0, 0, 2], &[])]);
    let mut harness = TestHarness::with_query(group_config(32.0, 1.0, "a"), query);
    harness.status.set_charging("a");
    harness.status.set(
        "b",
        PeerStatus {
            max_current: Some(10.0),
            ..charging_status()
        },
    );

    harness.run_cycle(3).unwrap();
    harness.assert_allocation("b", 10.0, AllocationReason::EqualShare).unwrap();
    harness.assert_allocation("a", 22.0, AllocationReason::EqualShare).unwrap();
    harness.assert_budget().unwrap();
}

#[test]
fn failsafe_trips_then_recovers() {
    let mut cfg = group_config(32.0, 1.0, "a");
    cfg.group.failsafe_current = 6.0;
    cfg.group.failsafe_missed_ticks = 3;
    let query = ScriptedQuery::always(Vec::new());
    let mut harness = TestHarness::with_query(cfg, query);
    harness.status.set_charging("a");

    harness.ticks(3);
    assert!(!harness.state().failsafe_active);
    harness.tick();
    let state = harness.state();
    assert!(state.failsafe_active);
    harness.assert_allocation("a", 6.0, AllocationReason::Failsafe).unwrap();
    harness.assert_budget().unwrap();

    // un pair réapparaît : la visibilité revient au cycle suivant
    harness.query.set_fallback(Some(vec![unit_record("b", [10, 0, 0, 2], &[])]));
    harness.handle.trigger_discovery();
    harness.run_cycle(3).unwrap();
    assert!(!harness.state().failsafe_active);
    harness.assert_allocation("a", 32.0, AllocationReason::EqualShare).unwrap();
}

#[test]
fn disabled_group_never_allocates() {
    let mut cfg = group_config(32.0, 1.0, "a");
    cfg.group.enabled = false;
    let mut harness = TestHarness::with_query(cfg, trio());
    harness.status.set_charging("a");
    harness.ticks(6);

    let state = harness.state();
    assert!(state.allocations.is_empty());
    assert!(!state.failsafe_active);
    assert_eq!(state.peers.len(), 3);
}

#[test]
fn config_mismatch_falls_back_to_floor() {
    let mut cfg = group_config(32.0, 1.0, "a");
    cfg.local.config_version = 2;
    cfg.local.config_hash = "aa".into();
    cfg.group.mismatch_current = 6.0;
    let mut harness = TestHarness::with_query(cfg, trio());

    let agreed = PeerStatus {
        config_version: 2,
        config_hash: "aa".into(),
        ..charging_status()
    };
    harness.status.set("a", agreed.clone());
    harness.status.set("b", agreed);
    harness.status.set(
        "c",
        PeerStatus {
            config_version: 1,
            config_hash: "bb".into(),
            ..charging_status()
        },
    );

    harness.run_cycle(3).unwrap();
    let state = harness.state();
    assert!(!state.config_consistent);
    assert_eq!(state.config_issues.len(), 1);
    assert!(state.config_issues[0].contains("c.local"));
    for id in ["a", "b", "c"] {
        harness.assert_allocation(id, 6.0, AllocationReason::ConfigMismatch).unwrap();
    }
}

#[test]
fn idle_and_unknown_status_get_nothing() {
    let mut harness = TestHarness::with_query(group_config(32.0, 1.0, "a"), trio());
    harness.status.set_charging("a");
    harness.status.set("b", idle_status());
    // c : aucun statut

    harness.run_cycle(3).unwrap();
    harness.assert_allocation("a", 32.0, AllocationReason::EqualShare).unwrap();
    harness.assert_allocation("b", 0.0, AllocationReason::NotCharging).unwrap();
    harness.assert_allocation("c", 0.0, AllocationReason::NotCharging).unwrap();
}

#[test]
fn joined_offline_peer_gets_offline_allocation() {
    let mut harness = TestHarness::with_query(group_config(32.0, 1.0, "a"), trio());
    harness.handle.join("d.local").unwrap();
    harness.handle.join("b.local").unwrap();
    harness.run_cycle(3).unwrap();

    let state = harness.state();
    let hosts: Vec<_> = state.peers.iter().map(|p| p.host.as_str()).collect();
    assert_eq!(hosts, ["a.local", "b.local", "c.local", "d.local"]);
    harness.assert_allocation("d", 0.0, AllocationReason::Offline).unwrap();
    assert!(state.peer_by_host("b.local").unwrap().joined);
    assert_eq!(state.offline_count, 1);
    harness.assert_budget().unwrap();
}

#[test]
fn start_failure_retries_next_tick() {
    let mut harness = TestHarness::with_query(group_config(32.0, 1.0, "a"), trio());
    harness.query.fail_next_starts(1);

    assert_eq!(harness.tick(), TickOutcome::StartFailed);
    assert!(!harness.handle.discovery_stats().query_in_progress);
    assert_eq!(harness.tick(), TickOutcome::Started);
    assert_eq!(harness.tick(), TickOutcome::Completed(3));
}

#[test]
fn shutdown_releases_in_flight_query_once() {
    let query = ScriptedQuery::new();
    let mut harness = TestHarness::with_query(group_config(32.0, 1.0, "a"), query.clone());
    assert_eq!(harness.tick(), TickOutcome::Started);
    assert_eq!(query.outstanding(), 1);

    harness.coordinator.shutdown();
    assert_eq!(query.outstanding(), 0);
    drop(harness);
    assert_eq!(query.released(), vec![1]);
    assert_eq!(query.double_releases(), 0);
}

#[test]
fn stable_id_comes_from_txt_and_survives_refresh() {
    let query = ScriptedQuery::always(vec![unit_record("openevse-7856", [10, 0, 0, 9], &[("id", "a7d47856")])]);
    let mut harness = TestHarness::with_query(group_config(32.0, 1.0, "a"), query.clone());
    harness.handle.join("openevse-7856.local").unwrap();
    harness.run_cycle(3).unwrap();

    let peers = harness.handle.peers(true, true);
    let unit = peers.iter().find(|p| p.host == "openevse-7856.local").unwrap();
    assert_eq!(unit.id, "a7d47856");
    assert!(unit.online && unit.joined);

    // le pair disparaît : toujours listé (rejoint), hors ligne, même id
    query.set_fallback(Some(Vec::new()));
    harness.handle.trigger_discovery();
    harness.run_cycle(3).unwrap();
    let state = harness.state();
    let unit = state.peer_by_host("openevse-7856.local").unwrap();
    assert_eq!(unit.id, "a7d47856");
    assert!(!unit.online);
}

#[test]
fn membership_save_retries_after_failure() {
    let mut harness = TestHarness::new(group_config(32.0, 1.0, "a"));
    harness.store.fail_next_writes(1);
    harness.handle.join("c.local").unwrap();

    harness.tick();
    assert!(harness.group.is_dirty());
    assert!(harness.store.contents("loadsharing_peers.json").is_none());

    harness.tick();
    assert!(!harness.group.is_dirty());
    let saved = harness.store.contents("loadsharing_peers.json").unwrap();
    assert!(saved.contains("c.local"));
    assert_eq!(
        harness.store.ops(),
        vec![
            StoreOp::Write(PathBuf::from("loadsharing_peers.json.tmp")),
            StoreOp::Rename(PathBuf::from("loadsharing_peers.json.tmp"), PathBuf::from("loadsharing_peers.json")),
        ]
    );

    // second save : l'ancien fichier est retiré avant le rename
    harness.store.clear_ops();
    harness.handle.join("d.local").unwrap();
    harness.tick();
    assert_eq!(
        harness.store.ops(),
        vec![
            StoreOp::Write(PathBuf::from("loadsharing_peers.json.tmp")),
            StoreOp::Remove(PathBuf::from("loadsharing_peers.json")),
            StoreOp::Rename(PathBuf::from("loadsharing_peers.json.tmp"), PathBuf::from("loadsharing_peers.json")),
        ]
    );
}

#[test]
fn untouched_membership_is_not_rewritten() {
    let mut harness = TestHarness::new(group_config(32.0, 1.0, "a"));
    harness.handle.join("c.local").unwrap();
    harness.handle.join("d.local").unwrap();
    harness.handle.leave("c.local").unwrap();
    harness.ticks(4);
    assert_eq!(harness.store.write_count(), 1);
}

#[test]
fn persisted_membership_reloads() {
    let store = MemoryStore::new().with_file("loadsharing_peers.json", br#"{"peers": ["x.local", " y.local ", "", "x.local"]}"#);
    let harness = TestHarness::build(group_config(32.0, 1.0, "a"), ScriptedQuery::new(), store);
    assert_eq!(harness.handle.group_members(), vec!["x.local".to_string(), "y.local".to_string()]);
    assert!(!harness.group.is_dirty());
}

#[test]
fn corrupt_membership_file_starts_empty() {
    let store = MemoryStore::new().with_file("loadsharing_peers.json", b"{ not json");
    let harness = TestHarness::build(group_config(32.0, 1.0, "a"), ScriptedQuery::new(), store);
    assert!(harness.handle.group_members().is_empty());
}

/// Générateur pseudo-aléatoire déterministe (LCG)
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    fn below(&mut self, n: u64) -> u64 {
        self.next() % n
    }
}

#[test]
fn budget_holds_for_arbitrary_groups() {
    let mut rng = Lcg(42);
    let local = LocalConf::default();
    let now = OffsetDateTime::now_utc();

    for round in 0..500 {
        let mut cfg = group_config(6.0 + rng.below(75) as f64 + 0.3, 0.5 + rng.below(51) as f64 / 100.0, "local").group;
        cfg.mismatch_current = rng.below(20) as f64;
        cfg.failsafe_current = rng.below(40) as f64;
        let engine = AllocationEngine::new(cfg.clone(), &local);

        let count = 1 + rng.below(10) as usize;
        let peers: Vec<Peer> = (0..count)
            .map(|i| {
                let mut peer = Peer::new(format!("p{i}"), format!("p{i}.local"));
                peer.online = rng.below(5) != 0;
                peer.local = i == 0;
                peer.status = PeerStatus {
                    vehicle: rng.below(4) != 0,
                    state: if rng.below(3) == 0 { evse_state::CONNECTED } else { evse_state::CHARGING },
                    config_hash: if rng.below(12) == 0 { "other".into() } else { String::new() },
                    max_current: if rng.below(3) == 0 { Some(rng.below(33) as f64 + 0.7) } else { None },
                    ..Default::default()
                };
                peer
            })
            .collect();

        let failsafe = rng.below(6) == 0;
        let state = engine.compute(&peers, failsafe, now);
        let total = state.total_allocated();
        assert!(
            total <= cfg.budget(),
            "round {round}: {total} A allocated for a {} A budget",
            cfg.budget()
        );
        assert_eq!(state.online_count + state.offline_count, state.peers.len());
        assert!(state.allocations.iter().all(|a| a.target_current >= 0.0));
        for (peer, allocation) in peers.iter().zip(&state.allocations) {
            assert_eq!(peer.id, allocation.id);
            if !peer.online && !(failsafe && peer.local) {
                assert_eq!(allocation.reason, AllocationReason::Offline);
            }
        }
    }
}

#[test]
fn peers_view_never_duplicates_hosts() {
    let query = ScriptedQuery::always(vec![
        unit_record("a", [10, 0, 0, 1], &[]),
        unit_record("b", [10, 0, 0, 2], &[]),
        unit_record("b", [10, 0, 0, 22], &[]),
    ]);
    let mut harness = TestHarness::with_query(group_config(32.0, 1.0, "a"), query);
    for host in ["b.local", "e.local", "f.local"] {
        harness.handle.join(host).unwrap();
    }
    harness.run_cycle(3).unwrap();

    let peers = harness.handle.peers(true, true);
    let mut hosts: Vec<_> = peers.iter().map(|p| p.host.clone()).collect();
    assert_eq!(hosts, ["a.local", "b.local", "e.local", "f.local"]);
    hosts.dedup();
    assert_eq!(hosts.len(), peers.len());
    // premier vu gagne
    assert_eq!(peers[1].ip, "10.0.0.2");
}

#[tokio::test]
async fn coordinator_task_runs_and_stops() {
    let harness = TestHarness::with_query(group_config(32.0, 1.0, "a"), trio());
    harness.status.set_charging("a");
    let TestHarness { coordinator, handle, query, .. } = harness;

    let (tx, rx) = tokio::sync::watch::channel(false);
    let task = tokio::spawn(coordinator.run(rx));
    handle.trigger_discovery();
    tokio::time::sleep(Duration::from_millis(100)).await;
    tx.send(true).unwrap();
    task.await.unwrap();

    assert!(handle.discovery_stats().discovery_count >= 1);
    assert_eq!(query.outstanding(), 0);
    assert_eq!(query.double_releases(), 0);
}

#[test]
fn on_disk_membership_survives_restart() {
    use loadshare_kernel::group::GroupStore;
    use std::sync::Arc;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("loadsharing_peers.json");
    let mut cfg = group_config(32.0, 1.0, "a");
    cfg.storage.peers_file = path.to_string_lossy().into_owned();

    let group = Arc::new(GroupStore::on_disk(&cfg.storage.peers_file));
    let status = Arc::new(loadshare_devkit::StaticStatusSource::new());
    let mut coordinator =
        loadshare_kernel::coordinator::Coordinator::new(&cfg, Box::new(ScriptedQuery::new()), group, status);
    coordinator.handle().join("b.local").unwrap();
    coordinator.shutdown();
    drop(coordinator);
    assert!(!dir.path().join("loadsharing_peers.json.tmp").exists());

    let reloaded = GroupStore::on_disk(&cfg.storage.peers_file);
    assert_eq!(reloaded.load().unwrap(), 1);
    assert!(reloaded.contains("b.local"));
}

#[test]
fn join_during_save_stays_pending_for_next_save() {
    use loadshare_kernel::group::GroupStore;
    use std::sync::Arc;

    let store = MemoryStore::new();
    let group = Arc::new(GroupStore::new("loadsharing_peers.json", Box::new(store.clone())));
    group.add("b.local").unwrap();

    // un join concurrent arrive pendant l'écriture du fichier temporaire
    let late = Arc::downgrade(&group);
    store.on_next_write(move || {
        if let Some(group) = late.upgrade() {
            group.add("late.local").unwrap();
        }
    });

    assert!(group.save().unwrap());
    assert!(group.contains("late.local"));
    assert!(group.is_dirty());
    let first = store.contents("loadsharing_peers.json").unwrap();
    assert!(first.contains("b.local"));
    assert!(!first.contains("late.local"));

    assert!(group.save().unwrap());
    assert!(!group.is_dirty());
    let second = store.contents("loadsharing_peers.json").unwrap();
    assert!(second.contains("late.local"));
    assert!(!group.save().unwrap());
}
