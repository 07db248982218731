// src/core/agent/repair.rs

//! Steady-state reconciliation of the shard and self-repair of the local
//! engine instance.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use super::Agent;
use crate::config::EngineMode;
use crate::core::engine::Node;
use crate::core::topology::{self, LagBound};
use crate::core::types::{HostState, ShardStateMap};

fn parse_u64(info: &HashMap<String, String>, key: &str) -> Option<u64> {
    info.get(key).and_then(|raw| raw.parse().ok())
}

/// Whether the engine is about to run out of client slots for the agents
/// themselves: maxclients minus cluster links minus connected clients dipping
/// under the reserve.
fn reserved_connections_exhausted(info: &HashMap<String, String>, reserved: u64) -> bool {
    let Some(maxclients) = parse_u64(info, "maxclients") else {
        return false;
    };
    let Some(clients) = parse_u64(info, "connected_clients") else {
        return false;
    };
    let cluster = parse_u64(info, "cluster_connections").unwrap_or(0);
    maxclients.saturating_sub(cluster).saturating_sub(clients) < reserved
}

impl Agent {
    /// Reconciles every reachable host with the expected topology: the master
    /// writable with the right quorum settings, replicas read-only and
    /// replicating from it, never exceeding the parallel-sync cap.
    pub(crate) async fn repair_shard(
        &self,
        shard_state: &ShardStateMap,
        active_nodes: &[String],
        master: &str,
    ) {
        let master_state = shard_state.get(master);
        let Some(master_node) = self.shard.get(master) else {
            error!("Repair shard: master {master} is not in the shard registry");
            return;
        };
        let master_identities = master_node.identities();

        let mut replicas: Vec<&String> = Vec::new();
        let mut syncing = 0usize;
        for (host, state) in shard_state {
            if !state.ping_ok {
                continue;
            }
            if host == master {
                self.repair_master(&master_node, active_nodes, state).await;
            } else {
                if let Some(rs) = &state.replica_state {
                    if rs.master_sync_in_progress
                        && topology::replicates(
                            master_state,
                            Some(rs),
                            host,
                            &master_identities,
                            true,
                        )
                    {
                        syncing += 1;
                    }
                }
                replicas.push(host);
            }
        }

        for host in replicas {
            let state = &shard_state[host];
            let Some(node) = self.shard.get(host) else {
                continue;
            };
            if !state.is_read_only {
                match node.set_read_only(false).await {
                    Ok(Err(rewrite_err)) => error!(
                        "Unable to rewrite config after making replica read-only on {host}: {rewrite_err}"
                    ),
                    Err(err) => error!("Unable to make replica {host} read-only: {err}"),
                    Ok(Ok(())) => {}
                }
            }
            let needs_repair = state.replica_state.is_none()
                || state.is_repl_paused
                || !topology::replicates(
                    master_state,
                    state.replica_state.as_ref(),
                    host,
                    &master_identities,
                    true,
                );
            if needs_repair {
                if syncing < self.config.engine.max_parallel_syncs {
                    if let Some(ms) = master_state {
                        self.repair_replica(&node, ms, state, master, host).await;
                        syncing += 1;
                    }
                } else {
                    error!(
                        "Leaving replica {host} broken: currently syncing {syncing}/{}",
                        self.config.engine.max_parallel_syncs
                    );
                }
            }
        }
    }

    /// Makes the master writable with quorum settings matching the active set.
    pub(crate) async fn repair_master(
        &self,
        node: &Arc<Node>,
        active_nodes: &[String],
        state: &HostState,
    ) {
        if state.is_read_only || state.min_replicas_to_write != 0 {
            match node.set_read_write().await {
                Ok(Err(rewrite_err)) => {
                    error!("Unable to rewrite config on master {}: {rewrite_err}", node.fqdn());
                }
                Err(err) => error!("Unable to make master {} writable: {err}", node.fqdn()),
                Ok(Ok(())) => {}
            }
        }
        let expected_quorum = self.get_num_replicas_to_write(active_nodes);
        match node.get_num_quorum_replicas().await {
            Ok(actual) if actual != expected_quorum as i64 => {
                info!(
                    "Changing quorum replicas from {actual} to {expected_quorum} on master {}",
                    node.fqdn()
                );
                match node.set_num_quorum_replicas(expected_quorum).await {
                    Ok(Err(rewrite_err)) => {
                        error!("Unable to rewrite config on master {}: {rewrite_err}", node.fqdn());
                    }
                    Err(err) => {
                        error!("Unable to set quorum replicas on master {}: {err}", node.fqdn());
                    }
                    Ok(Ok(())) => {}
                }
            }
            Ok(_) => {}
            Err(err) => {
                error!("Unable to get actual quorum replicas on master {}: {err}", node.fqdn());
                return;
            }
        }
        if state.is_repl_paused {
            if let Err(err) = node.resume_replication().await {
                error!("Unable to resume replication on master {}: {err}", node.fqdn());
            }
        }
    }

    /// Re-attaches a replica to the current master, mode-dispatched.
    pub(crate) async fn repair_replica(
        &self,
        node: &Arc<Node>,
        master_state: &HostState,
        state: &HostState,
        master: &str,
        replica_fqdn: &str,
    ) {
        let Some(master_node) = self.shard.get(master) else {
            return;
        };
        let master_identities = master_node.identities();
        if !topology::replicates(
            Some(master_state),
            state.replica_state.as_ref(),
            replica_fqdn,
            &master_identities,
            true,
        ) {
            info!("Initiating replica repair on {replica_fqdn}");
            match self.config.mode {
                EngineMode::Sentinel => {
                    if let Err(err) = node.sentinel_make_replica(master).await {
                        error!("Unable to make {replica_fqdn} replica of {master}: {err}");
                    }
                }
                EngineMode::Cluster => {
                    match node.is_cluster_node_alone().await {
                        Ok(true) => {
                            let addr = master_state.ip.clone();
                            if addr.is_empty() {
                                error!("Unable to meet {replica_fqdn} with {master}: master ip unknown");
                            } else if let Err(err) = node
                                .cluster_meet(
                                    &addr,
                                    self.config.engine.port,
                                    self.config.engine.cluster_bus_port,
                                )
                                .await
                            {
                                error!("Unable to meet {replica_fqdn} with {master}: {err}");
                            }
                        }
                        Ok(false) => {}
                        Err(err) => {
                            error!("Unable to check cluster membership of {replica_fqdn}: {err}");
                        }
                    }
                    let master_id = match master_node.cluster_get_id().await {
                        Ok(id) => id,
                        Err(err) => {
                            error!("Unable to get cluster id of {master}: {err}");
                            return;
                        }
                    };
                    if let Err(err) = node.cluster_make_replica(&master_id).await {
                        error!(
                            "Unable to make {replica_fqdn} replica of {master} ({master_id}): {err}"
                        );
                    }
                }
            }
        }
        if state.is_repl_paused {
            if let Err(err) = node.resume_replication().await {
                error!("Unable to resume replication on {replica_fqdn}: {err}");
            }
        }
    }

    /// Self-repair of the local engine. Returns whether the local node is
    /// online and eligible, i.e. the active set may be refreshed this tick.
    pub(crate) async fn repair_local_node(
        &mut self,
        shard_state: &ShardStateMap,
        master: &str,
    ) -> bool {
        let Some(local) = self.shard.local() else {
            return false;
        };
        let fqdn = local.fqdn().to_string();

        let local_state = match local.get_state().await {
            Ok(state) => state,
            Err(err) => {
                error!("Unable to get local node state: {err}");
                if err.is_loading() {
                    // the engine is starting up, give it time
                    self.runtime.node_fail_time.remove(&fqdn);
                    return false;
                }
                let failed_at = *self
                    .runtime
                    .node_fail_time
                    .entry(fqdn.clone())
                    .or_insert_with(Instant::now);
                let failed_time = failed_at.elapsed();
                if err.is_busy() {
                    if failed_time > self.config.engine.busy_timeout {
                        warn!("Local node is busy for {failed_time:?}, killing running script");
                        self.runtime.node_fail_time.insert(fqdn.clone(), Instant::now());
                        if let Err(kill_err) = local.script_kill().await {
                            error!("Unable to kill busy script: {kill_err}");
                        }
                    }
                } else if failed_time > self.config.engine.restart_timeout {
                    self.runtime.node_fail_time.insert(fqdn.clone(), Instant::now());
                    if let Err(restart_err) = local.restart().await {
                        error!("Unable to restart local node: {restart_err}");
                    }
                }
                return false;
            }
        };
        self.runtime.node_fail_time.remove(&fqdn);

        if !local_state.is_offline {
            if let Err(err) = self.adjust_aof_mode(master).await {
                error!("Unable to adjust aof mode: {err}");
            }
            if let Some(db_state) = shard_state.get(&fqdn) {
                self.close_stale_replica(master, db_state).await;
            }
            if reserved_connections_exhausted(
                &local_state.info,
                self.config.engine.reserved_connections,
            ) {
                warn!("Local node is running out of client connections, disconnecting clients");
                if let Err(err) = local.disconnect_clients("normal").await {
                    error!("Unable to disconnect clients: {err}");
                }
            }
            return true;
        }

        // reachable but offline: decide whether to re-open
        let Some(state) = shard_state.get(&fqdn) else {
            error!("Local repair: unable to find local node in shard state");
            return false;
        };
        if master == fqdn && shard_state.len() != 1 {
            let active_nodes = match self.get_active_nodes().await {
                Ok(nodes) => nodes,
                Err(err) => {
                    error!("Unable to get active nodes for local node repair: {err}");
                    return false;
                }
            };
            let base_offset = topology::offset(state);
            let mut ahead_hosts = 0;
            for (host, host_state) in shard_state {
                if host == master {
                    continue;
                }
                if base_offset < topology::offset(host_state) && active_nodes.contains(host) {
                    warn!("Host {host} is ahead in replication history");
                    ahead_hosts += 1;
                }
            }
            if ahead_hosts != 0 {
                error!(
                    "Not making local node online: {ahead_hosts} nodes are ahead in replication history"
                );
                return false;
            }
        } else if master == fqdn && shard_state.len() == 1 {
            if state.replica_state.is_some() {
                info!("Single-node shard master reports as replica, promoting");
                let promote_result = match self.config.mode {
                    EngineMode::Sentinel => local.sentinel_promote().await,
                    EngineMode::Cluster => local.cluster_promote_force().await,
                };
                if let Err(err) = promote_result {
                    error!("Unable to promote single-node master: {err}");
                    return false;
                }
            }
        } else if master != fqdn {
            let stale = topology::is_replica_stale(
                state,
                self.config.engine.stale_replica_lag_open,
                self.runtime.dcs_diverge_time.map(|at| at.elapsed()),
                LagBound::Open,
            );
            let master_healthy = shard_state
                .get(master)
                .is_some_and(|ms| ms.ping_ok && ms.ping_stable);
            if stale && master_healthy && !self.run_destructive_replication_repair().await {
                return false;
            }
        }
        if let Err(err) = local.set_online().await {
            error!("Unable to set local node online: {err}");
            return false;
        }
        true
    }
}
