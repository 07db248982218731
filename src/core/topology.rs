// src/core/topology.rs

//! Pure shard-topology decisions over collected state snapshots.
//!
//! Everything here is side-effect free: the agent gathers host states,
//! priorities and identity lists, and these functions decide. This keeps the
//! quorum and selection rules testable without a live engine or DCS.

use crate::core::types::{HostState, ReplicaState, ShardStateMap};
use anyhow::{Result, anyhow};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{error, warn};

/// Default master-candidate priority assigned to hosts without an operator override.
pub const DEFAULT_PRIORITY: i64 = 100;

/// Replication offset of a host as seen by the failover logic.
///
/// Unstable hosts count as zero so a flapping node never wins selection.
pub fn offset(state: &HostState) -> i64 {
    if !state.ping_ok || !state.ping_stable {
        return 0;
    }
    if state.is_master {
        state.master_replication_offset
    } else if let Some(rs) = &state.replica_state {
        rs.replication_offset
    } else {
        0
    }
}

/// Whether `replica` could partially resync from `master` without a full copy.
pub fn is_partial_sync_possible(replica: &HostState, master: &HostState) -> bool {
    let Some(rs) = &replica.replica_state else {
        return false;
    };
    let psync_offset = rs.replication_offset + 1;
    if master.replication_id != replica.replication_id
        && (master.replication_id2 != replica.replication_id
            || psync_offset > master.second_replication_offset)
    {
        return false;
    }
    if psync_offset < master.replication_backlog_start
        || psync_offset > master.replication_backlog_start + master.replication_backlog_size
    {
        return false;
    }
    true
}

/// Host with the maximum replication offset, ties broken by name for determinism.
pub fn find_most_recent_node(shard_state: &ShardStateMap) -> Option<String> {
    let mut recent: Option<(&str, i64)> = None;
    for (host, state) in shard_state {
        let host_offset = offset(state);
        if host_offset == 0 {
            continue;
        }
        match recent {
            Some((_, best)) if host_offset < best => {}
            Some((name, best)) if host_offset == best && host.as_str() > name => {}
            _ => recent = Some((host.as_str(), host_offset)),
        }
    }
    recent.map(|(host, _)| host.to_string())
}

/// Selects the new master among hosts that can partially sync from the most
/// recent one, preferring higher priority and then higher offset.
///
/// Hosts whose fqdn starts with `switchover_from` are never considered.
pub fn most_desirable_node(
    shard_state: &ShardStateMap,
    priorities: &HashMap<String, i64>,
    switchover_from: &str,
) -> Result<String> {
    let recent = find_most_recent_node(shard_state)
        .ok_or_else(|| anyhow!("no host with a usable replication offset"))?;
    let recent_state = &shard_state[&recent];

    let mut candidates: Vec<&str> = Vec::new();
    for (host, state) in shard_state {
        if !switchover_from.is_empty() && host.starts_with(switchover_from) {
            continue;
        }
        if *host == recent || is_partial_sync_possible(state, recent_state) {
            candidates.push(host.as_str());
        }
    }

    if candidates.is_empty() {
        return Err(anyhow!(
            "no hosts with psync possible from most recent one: {recent}"
        ));
    }
    candidates.sort_unstable();

    let mut best: Option<(&str, i64, i64)> = None;
    for host in candidates {
        let priority = priorities.get(host).copied().unwrap_or(DEFAULT_PRIORITY);
        let host_offset = offset(&shard_state[host]);
        match best {
            Some((_, p, o)) if priority < p || (priority == p && host_offset <= o) => {}
            _ => best = Some((host, priority, host_offset)),
        }
    }

    Ok(best.map(|(host, _, _)| host.to_string()).expect("non-empty"))
}

/// Whether `replica_state` indicates replication from the master described by
/// `master_state` / `master_identities` (fqdn plus resolved IPs).
pub fn replicates(
    master_state: Option<&HostState>,
    replica_state: Option<&ReplicaState>,
    replica_fqdn: &str,
    master_identities: &[String],
    allow_sync: bool,
) -> bool {
    let Some(rs) = replica_state else {
        return false;
    };
    if !(rs.master_link_state || allow_sync) {
        return false;
    }
    if let Some(ms) = master_state {
        if ms.connected_replicas.iter().any(|r| r == replica_fqdn) {
            return true;
        }
    }
    master_identities.iter().any(|id| *id == rs.master_host)
}

/// Number of nodes within `nodes` that are stable, alive HA replicas.
pub fn count_alive_ha_replicas_within_nodes(nodes: &[String], shard_state: &ShardStateMap) -> usize {
    nodes
        .iter()
        .filter(|host| {
            shard_state.get(*host).is_some_and(|state| {
                state.ping_ok && state.ping_stable && state.replica_state.is_some()
            })
        })
        .count()
}

/// Number of replicas in the shard currently online with a live or syncing link.
pub fn count_running_ha_replicas(shard_state: &ShardStateMap) -> usize {
    shard_state
        .values()
        .filter(|state| {
            state.ping_ok
                && !state.is_offline
                && state
                    .replica_state
                    .as_ref()
                    .is_some_and(|rs| rs.master_link_state || rs.master_sync_in_progress)
        })
        .count()
}

/// Replicas the master must see before accepting writes.
pub fn replicas_to_write(active_len: usize) -> usize {
    active_len / 2
}

/// Minimum alive-HA-replica count required to allow a promotion.
pub fn failover_quorum(active_len: usize, allow_data_loss: bool) -> usize {
    let fq = active_len.saturating_sub(replicas_to_write(active_len));
    if fq < 1 || allow_data_loss { 1 } else { fq }
}

/// Lag bound being evaluated when deciding replica staleness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LagBound {
    /// Deciding whether a closed replica may be re-opened. Strict.
    Open,
    /// Deciding whether an open replica must self-close. Lax.
    Close,
}

/// Whether a replica's divergence from its master exceeds `bound`.
///
/// `diverge_elapsed` is how long the host has reported no replica substate at
/// all (None while the substate is present).
pub fn is_replica_stale(
    state: &HostState,
    bound: Duration,
    diverge_elapsed: Option<Duration>,
    evaluating: LagBound,
) -> bool {
    match &state.replica_state {
        None => diverge_elapsed.is_some_and(|elapsed| elapsed > bound),
        Some(rs) if !rs.master_link_state => {
            if rs.master_sync_in_progress || evaluating == LagBound::Open {
                return true;
            }
            rs.master_link_down_time > bound.as_millis() as i64
        }
        Some(rs) => rs.master_last_io_seconds > bound.as_secs() as i64,
    }
}

/// Inputs for the active-set computation that do not change per host.
pub struct ActiveNodesContext<'a> {
    pub master: &'a str,
    pub master_identities: &'a [String],
    pub inactivation_delay: Duration,
}

/// Recomputes the active set from the two state snapshots.
///
/// A host leaves the set only after failing longer than the inactivation delay
/// (and only if its DCS health record is gone too); a host joins only when it
/// is healthy and replicating from the current master. The result is sorted.
pub fn calc_active_nodes(
    shard_state: &ShardStateMap,
    shard_state_dcs: &ShardStateMap,
    old_active: &[String],
    ctx: &ActiveNodesContext<'_>,
    fail_times: &mut HashMap<String, Instant>,
) -> Vec<String> {
    let mut active_nodes: Vec<String> = Vec::new();
    let master_state = shard_state.get(ctx.master);
    if master_state.is_some() {
        active_nodes.push(ctx.master.to_string());
    }

    for (host, state) in shard_state {
        if host == ctx.master {
            continue;
        }
        let dcs_state = shard_state_dcs.get(host);
        if !state.ping_ok {
            if dcs_state.is_some_and(|s| s.ping_ok) {
                if old_active.contains(host) {
                    warn!("Calc active nodes: {host} keeps health lock in dcs, keeping active...");
                    active_nodes.push(host.clone());
                }
                continue;
            }
            let failed_since = *fail_times.entry(host.clone()).or_insert_with(Instant::now);
            let fail_time = failed_since.elapsed();
            if fail_time < ctx.inactivation_delay {
                if old_active.contains(host) {
                    warn!(
                        "Calc active nodes: {host} is failing, remaining {:?}",
                        ctx.inactivation_delay - fail_time
                    );
                    active_nodes.push(host.clone());
                }
                continue;
            }
            error!("Calc active nodes: {host} is down, deleting from active...");
            continue;
        } else if !dcs_state.is_some_and(|s| s.is_offline) {
            fail_times.remove(host);
        }
        let Some(replica_state) = &state.replica_state else {
            warn!("Calc active nodes: lost master {host}");
            continue;
        };
        let master_alive = master_state.is_some_and(|ms| ms.ping_ok && ms.ping_stable);
        if master_alive
            && !replicates(
                master_state,
                Some(replica_state),
                host,
                ctx.master_identities,
                false,
            )
        {
            error!("Calc active nodes: {host} is not replicating from alive master, deleting from active...");
            continue;
        }
        active_nodes.push(host.clone());
    }

    active_nodes.sort_unstable();
    active_nodes
}
