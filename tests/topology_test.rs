// tests/topology_test.rs

//! Unit tests for the pure shard-topology decisions.

use shardkeeper::core::topology::{
    self, ActiveNodesContext, LagBound, calc_active_nodes, failover_quorum,
    is_partial_sync_possible, is_replica_stale, most_desirable_node, replicates,
};
use shardkeeper::core::types::{HostState, ReplicaState, ShardStateMap};
use std::collections::HashMap;
use std::time::{Duration, Instant};

fn master(offset: i64) -> HostState {
    HostState {
        ping_ok: true,
        ping_stable: true,
        is_master: true,
        master_replication_offset: offset,
        replication_id: "replid-a".to_string(),
        replication_id2: "0".repeat(40),
        replication_backlog_start: 1,
        replication_backlog_size: 1_000_000,
        ..HostState::default()
    }
}

fn replica(master_host: &str, offset: i64) -> HostState {
    HostState {
        ping_ok: true,
        ping_stable: true,
        replication_id: "replid-a".to_string(),
        replica_state: Some(ReplicaState {
            master_host: master_host.to_string(),
            master_link_state: true,
            replication_offset: offset,
            ..ReplicaState::default()
        }),
        ..HostState::default()
    }
}

#[test]
fn offset_of_unstable_host_is_zero() {
    let mut state = master(4242);
    assert_eq!(topology::offset(&state), 4242);
    state.ping_stable = false;
    assert_eq!(topology::offset(&state), 0);
    state.ping_stable = true;
    state.ping_ok = false;
    assert_eq!(topology::offset(&state), 0);
}

#[test]
fn offset_uses_replica_offset_for_replicas() {
    let state = replica("db1", 100);
    assert_eq!(topology::offset(&state), 100);
}

#[test]
fn partial_sync_possible_within_backlog() {
    let m = master(5000);
    let r = replica("db1", 4000);
    assert!(is_partial_sync_possible(&r, &m));
}

#[test]
fn partial_sync_impossible_on_replication_id_mismatch() {
    let m = master(5000);
    let mut r = replica("db1", 4000);
    r.replication_id = "replid-b".to_string();
    assert!(!is_partial_sync_possible(&r, &m));
}

#[test]
fn partial_sync_possible_via_previous_replication_id() {
    let mut m = master(5000);
    m.replication_id = "replid-b".to_string();
    m.replication_id2 = "replid-a".to_string();
    m.second_replication_offset = 4500;
    let r = replica("db1", 4000);
    assert!(is_partial_sync_possible(&r, &m));

    // replica offset past the point where the history diverged
    let r = replica("db1", 4600);
    assert!(!is_partial_sync_possible(&r, &m));
}

#[test]
fn partial_sync_impossible_outside_backlog_window() {
    let mut m = master(500_000);
    m.replication_backlog_start = 400_000;
    m.replication_backlog_size = 100_000;
    let r = replica("db1", 100_000);
    assert!(!is_partial_sync_possible(&r, &m));
}

#[test]
fn partial_sync_impossible_without_replica_state() {
    let m = master(5000);
    let r = master(4000);
    assert!(!is_partial_sync_possible(&r, &m));
}

#[test]
fn most_recent_node_picks_maximum_offset() {
    let mut state = ShardStateMap::new();
    state.insert("db1".to_string(), master(5000));
    state.insert("db2".to_string(), replica("db1", 4999));
    state.insert("db3".to_string(), replica("db1", 3000));
    assert_eq!(
        topology::find_most_recent_node(&state),
        Some("db1".to_string())
    );
}

#[test]
fn most_recent_node_breaks_ties_deterministically() {
    let mut state = ShardStateMap::new();
    state.insert("db3".to_string(), replica("db1", 4000));
    state.insert("db2".to_string(), replica("db1", 4000));
    assert_eq!(
        topology::find_most_recent_node(&state),
        Some("db2".to_string())
    );
}

#[test]
fn most_desirable_prefers_priority_over_offset() {
    let mut state = ShardStateMap::new();
    state.insert("db1".to_string(), replica("old", 5000));
    state.insert("db2".to_string(), replica("old", 4000));
    let mut priorities = HashMap::new();
    priorities.insert("db1".to_string(), 100);
    priorities.insert("db2".to_string(), 200);
    let chosen = most_desirable_node(&state, &priorities, "").expect("candidate");
    assert_eq!(chosen, "db2");
}

#[test]
fn most_desirable_uses_offset_within_equal_priority() {
    let mut state = ShardStateMap::new();
    state.insert("db1".to_string(), replica("old", 5000));
    state.insert("db2".to_string(), replica("old", 4000));
    let chosen = most_desirable_node(&state, &HashMap::new(), "").expect("candidate");
    assert_eq!(chosen, "db1");
}

#[test]
fn most_desirable_excludes_switchover_source() {
    let mut state = ShardStateMap::new();
    state.insert("db1".to_string(), replica("old", 5000));
    state.insert("db2".to_string(), replica("old", 4000));
    let chosen = most_desirable_node(&state, &HashMap::new(), "db1").expect("candidate");
    assert_eq!(chosen, "db2");
}

#[test]
fn most_desirable_fails_without_candidates() {
    let mut state = ShardStateMap::new();
    state.insert("db1".to_string(), replica("old", 5000));
    assert!(most_desirable_node(&state, &HashMap::new(), "db1").is_err());
}

#[test]
fn replicates_accepts_connected_replica_entry() {
    let mut m = master(5000);
    m.connected_replicas = vec!["db2".to_string()];
    let r = replica("some-other-name", 4000);
    assert!(replicates(
        Some(&m),
        r.replica_state.as_ref(),
        "db2",
        &[],
        false
    ));
}

#[test]
fn replicates_accepts_master_identity_match() {
    let m = master(5000);
    let r = replica("192.0.2.15", 4000);
    let identities = vec!["db1".to_string(), "192.0.2.15".to_string()];
    assert!(replicates(
        Some(&m),
        r.replica_state.as_ref(),
        "db2",
        &identities,
        false
    ));
}

#[test]
fn replicates_rejects_down_link_unless_syncing_allowed() {
    let m = master(5000);
    let mut r = replica("db1", 4000);
    r.replica_state.as_mut().unwrap().master_link_state = false;
    let identities = vec!["db1".to_string()];
    assert!(!replicates(
        Some(&m),
        r.replica_state.as_ref(),
        "db2",
        &identities,
        false
    ));
    assert!(replicates(
        Some(&m),
        r.replica_state.as_ref(),
        "db2",
        &identities,
        true
    ));
}

#[test]
fn failover_quorum_follows_active_set_size() {
    assert_eq!(failover_quorum(1, false), 1);
    assert_eq!(failover_quorum(2, false), 1);
    assert_eq!(failover_quorum(3, false), 2);
    assert_eq!(failover_quorum(4, false), 2);
    assert_eq!(failover_quorum(5, false), 3);
}

#[test]
fn allow_data_loss_forces_quorum_of_one() {
    assert_eq!(failover_quorum(5, true), 1);
}

#[test]
fn alive_ha_replica_count_requires_stability_and_replica_state() {
    let mut state = ShardStateMap::new();
    state.insert("db1".to_string(), master(5000));
    state.insert("db2".to_string(), replica("db1", 4000));
    let mut flapping = replica("db1", 4000);
    flapping.ping_stable = false;
    state.insert("db3".to_string(), flapping);
    let nodes = vec!["db1".to_string(), "db2".to_string(), "db3".to_string()];
    assert_eq!(
        topology::count_alive_ha_replicas_within_nodes(&nodes, &state),
        1
    );
}

#[test]
fn replica_without_substate_is_stale_after_divergence_bound() {
    let mut state = replica("db1", 100);
    state.replica_state = None;
    let bound = Duration::from_secs(60);
    assert!(!is_replica_stale(&state, bound, None, LagBound::Close));
    assert!(!is_replica_stale(
        &state,
        bound,
        Some(Duration::from_secs(30)),
        LagBound::Close
    ));
    assert!(is_replica_stale(
        &state,
        bound,
        Some(Duration::from_secs(90)),
        LagBound::Close
    ));
}

#[test]
fn down_link_is_stale_after_down_time_bound() {
    let mut state = replica("db1", 100);
    {
        let rs = state.replica_state.as_mut().unwrap();
        rs.master_link_state = false;
        rs.master_link_down_time = 30_000;
    }
    let bound = Duration::from_secs(60);
    assert!(!is_replica_stale(&state, bound, None, LagBound::Close));
    state.replica_state.as_mut().unwrap().master_link_down_time = 90_000;
    assert!(is_replica_stale(&state, bound, None, LagBound::Close));
}

#[test]
fn down_link_is_immediately_stale_for_open_bound_or_while_syncing() {
    let mut state = replica("db1", 100);
    {
        let rs = state.replica_state.as_mut().unwrap();
        rs.master_link_state = false;
        rs.master_link_down_time = 1;
    }
    let bound = Duration::from_secs(60);
    assert!(is_replica_stale(&state, bound, None, LagBound::Open));
    state.replica_state.as_mut().unwrap().master_sync_in_progress = true;
    assert!(is_replica_stale(&state, bound, None, LagBound::Close));
}

#[test]
fn up_link_is_stale_on_io_silence() {
    let mut state = replica("db1", 100);
    state.replica_state.as_mut().unwrap().master_last_io_seconds = 120;
    let bound = Duration::from_secs(60);
    assert!(is_replica_stale(&state, bound, None, LagBound::Close));
    state.replica_state.as_mut().unwrap().master_last_io_seconds = 10;
    assert!(!is_replica_stale(&state, bound, None, LagBound::Close));
}

fn active_ctx<'a>(master: &'a str, identities: &'a [String]) -> ActiveNodesContext<'a> {
    ActiveNodesContext {
        master,
        master_identities: identities,
        inactivation_delay: Duration::from_secs(30),
    }
}

#[test]
fn active_set_contains_master_and_healthy_replicas_sorted() {
    let mut state = ShardStateMap::new();
    state.insert("db2".to_string(), master(5000));
    state.insert("db3".to_string(), replica("db2", 4000));
    state.insert("db1".to_string(), replica("db2", 3000));
    let identities = vec!["db2".to_string()];
    let mut timers = HashMap::new();
    let active = calc_active_nodes(
        &state,
        &ShardStateMap::new(),
        &[],
        &active_ctx("db2", &identities),
        &mut timers,
    );
    assert_eq!(active, vec!["db1", "db2", "db3"]);
}

#[test]
fn failing_host_survives_within_inactivation_delay() {
    let mut state = ShardStateMap::new();
    state.insert("db1".to_string(), master(5000));
    let mut dead = replica("db1", 4000);
    dead.ping_ok = false;
    state.insert("db2".to_string(), dead);
    let identities = vec!["db1".to_string()];
    let old_active = vec!["db1".to_string(), "db2".to_string()];
    let mut timers = HashMap::new();
    let active = calc_active_nodes(
        &state,
        &ShardStateMap::new(),
        &old_active,
        &active_ctx("db1", &identities),
        &mut timers,
    );
    assert_eq!(active, vec!["db1", "db2"]);
    assert!(timers.contains_key("db2"));
}

#[test]
fn failing_host_is_removed_after_inactivation_delay() {
    let mut state = ShardStateMap::new();
    state.insert("db1".to_string(), master(5000));
    let mut dead = replica("db1", 4000);
    dead.ping_ok = false;
    state.insert("db2".to_string(), dead);
    let identities = vec!["db1".to_string()];
    let old_active = vec!["db1".to_string(), "db2".to_string()];
    let ctx = ActiveNodesContext {
        master: "db1",
        master_identities: &identities,
        inactivation_delay: Duration::ZERO,
    };
    let mut timers = HashMap::new();
    timers.insert("db2".to_string(), Instant::now());
    let active = calc_active_nodes(&state, &ShardStateMap::new(), &old_active, &ctx, &mut timers);
    assert_eq!(active, vec!["db1"]);
}

#[test]
fn host_with_live_health_record_is_kept_active() {
    let mut state = ShardStateMap::new();
    state.insert("db1".to_string(), master(5000));
    let mut dead = replica("db1", 4000);
    dead.ping_ok = false;
    state.insert("db2".to_string(), dead);
    let mut state_dcs = ShardStateMap::new();
    state_dcs.insert("db2".to_string(), replica("db1", 4000));
    let identities = vec!["db1".to_string()];
    let old_active = vec!["db1".to_string(), "db2".to_string()];
    let mut timers = HashMap::new();
    let active = calc_active_nodes(
        &state,
        &state_dcs,
        &old_active,
        &active_ctx("db1", &identities),
        &mut timers,
    );
    assert_eq!(active, vec!["db1", "db2"]);
    // the health record, not the failure timer, kept it active
    assert!(!timers.contains_key("db2"));
}

#[test]
fn replica_of_foreign_master_is_not_active() {
    let mut state = ShardStateMap::new();
    state.insert("db1".to_string(), master(5000));
    state.insert("db2".to_string(), replica("unrelated-host", 4000));
    let identities = vec!["db1".to_string()];
    let mut timers = HashMap::new();
    let active = calc_active_nodes(
        &state,
        &ShardStateMap::new(),
        &[],
        &active_ctx("db1", &identities),
        &mut timers,
    );
    assert_eq!(active, vec!["db1"]);
}

#[test]
fn second_master_is_not_active() {
    let mut state = ShardStateMap::new();
    state.insert("db1".to_string(), master(5000));
    state.insert("db2".to_string(), master(4000));
    let identities = vec!["db1".to_string()];
    let mut timers = HashMap::new();
    let active = calc_active_nodes(
        &state,
        &ShardStateMap::new(),
        &[],
        &active_ctx("db1", &identities),
        &mut timers,
    );
    assert_eq!(active, vec!["db1"]);
}
