// src/core/agent/master.rs

//! Master identification and the replica re-pointing primitives used by
//! switchover: change-master, catch-up wait and mode-dispatched promotion.

use anyhow::{Result, anyhow};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::Agent;
use crate::config::EngineMode;
use crate::core::dcs::{self, DcsError};
use crate::core::topology;
use crate::core::types::{PATH_MASTER_NODE, ShardStateMap};

impl Agent {
    /// Replicas the active set obliges the master to see before writes.
    pub(crate) fn get_num_replicas_to_write(&self, active_nodes: &[String]) -> usize {
        topology::replicas_to_write(active_nodes.len())
    }

    /// Returns the DCS master if set, repairing DCS/engine divergence only
    /// when every host is stable; derives the master from the engines
    /// otherwise.
    pub(crate) async fn get_current_master(
        &mut self,
        shard_state: &ShardStateMap,
    ) -> Result<String> {
        let master = match dcs::get_json::<String>(self.dcs.as_ref(), PATH_MASTER_NODE).await {
            Ok(master) => master,
            Err(DcsError::NotFound) => String::new(),
            Err(err) => return Err(anyhow!("failed to get current master from dcs: {err}")),
        };
        if !master.is_empty() {
            let state_master = match self.get_master_host(shard_state).await {
                Ok(host) => host,
                Err(err) => {
                    warn!("Have master in DCS but unable to validate: {err}");
                    return Ok(master);
                }
            };
            if !state_master.is_empty() && state_master != master {
                warn!("DCS and engine master state diverged: {master} and {state_master}");
                let mut all_stable = true;
                for (host, state) in shard_state {
                    if !state.ping_stable || state.is_offline {
                        all_stable = false;
                        warn!("{host} is dead skipping divergence fix");
                        break;
                    }
                }
                if all_stable {
                    return self.ensure_current_master(shard_state).await;
                }
            }
            return Ok(master);
        }
        self.ensure_current_master(shard_state).await
    }

    /// The single alive master the engines report, or an empty string.
    /// Cluster-mode ties are broken by slot ownership.
    pub(crate) async fn get_master_host(&self, shard_state: &ShardStateMap) -> Result<String> {
        let mut masters: Vec<&String> = shard_state
            .iter()
            .filter(|(_, state)| state.ping_ok && state.is_master)
            .map(|(host, _)| host)
            .collect();
        masters.sort_unstable();
        if masters.len() > 1 {
            if self.config.mode == EngineMode::Cluster {
                let mut masters_with_slots = Vec::new();
                for master in &masters {
                    let node = self
                        .shard
                        .get(master)
                        .ok_or_else(|| anyhow!("{master} is not in the shard registry"))?;
                    let has_slots = node
                        .has_cluster_slots()
                        .await
                        .map_err(|_| anyhow!("unable to check slots on {master}"))?;
                    if has_slots {
                        masters_with_slots.push((*master).clone());
                    }
                }
                if masters_with_slots.len() == 1 {
                    return Ok(masters_with_slots.remove(0));
                }
            }
            return Err(anyhow!("got more than 1 master: {masters:?}"));
        }
        Ok(masters.first().map(|m| (*m).clone()).unwrap_or_default())
    }

    /// Derives the master from the engines and records it in the DCS.
    pub(crate) async fn ensure_current_master(
        &mut self,
        shard_state: &ShardStateMap,
    ) -> Result<String> {
        let master = self.get_master_host(shard_state).await?;
        if master.is_empty() {
            return Err(anyhow!("no master in shard of {} nodes", shard_state.len()));
        }
        dcs::set_json(self.dcs.as_ref(), PATH_MASTER_NODE, &master)
            .await
            .map_err(|err| anyhow!("failed to set current master in dcs: {err}"))?;
        Ok(master)
    }

    /// Points `host` at `master` and waits until it reports replicating from
    /// it, bounded by the replication-wait timeout.
    pub(crate) async fn change_master(&self, host: &str, master: &str) -> Result<()> {
        if host == master {
            return Err(anyhow!("changing {host} replication source to itself"));
        }
        let node = self
            .shard
            .get(host)
            .ok_or_else(|| anyhow!("{host} is not in the shard registry"))?;
        let master_node = self
            .shard
            .get(master)
            .ok_or_else(|| anyhow!("{master} is not in the shard registry"))?;
        let mut master_state = self.get_host_state(master).await;
        let mut state = self.get_host_state(host).await;

        if !state.ping_ok {
            return Err(anyhow!(
                "changeMaster: replica {host} is dead - unable to init repair"
            ));
        }

        self.repair_replica(&node, &master_state, &state, master, host)
            .await;

        let deadline = Instant::now() + self.config.engine.wait_replication_timeout;
        let master_identities = master_node.identities();
        while Instant::now() < deadline && !self.cancel.is_cancelled() {
            state = self.get_host_state(host).await;
            if topology::replicates(
                Some(&master_state),
                state.replica_state.as_ref(),
                host,
                &master_identities,
                false,
            ) {
                break;
            }
            if !state.ping_ok {
                return Err(anyhow!(
                    "changeMaster: replica {host} died while waiting to start replication from {master}"
                ));
            }
            master_state = self.get_host_state(master).await;
            if !master_state.ping_ok {
                return Err(anyhow!(
                    "changeMaster: {master} died while waiting to start replication to {host}"
                ));
            }
            info!("ChangeMaster: waiting for {host} to start replication from {master}");
            self.repair_replica(&node, &master_state, &state, master, host)
                .await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        if topology::replicates(
            Some(&master_state),
            state.replica_state.as_ref(),
            host,
            &master_identities,
            false,
        ) {
            info!("ChangeMaster: {host} started replication from {master}");
            Ok(())
        } else {
            Err(anyhow!(
                "{host} was unable to start replication from {master}"
            ))
        }
    }

    /// Waits until `host`'s replication offset reaches `master`'s.
    pub(crate) async fn wait_for_catchup(&self, host: &str, master: &str) -> Result<()> {
        if host == master {
            return Err(anyhow!("waiting for {host} to catchup with itself"));
        }
        let deadline = Instant::now() + self.config.engine.wait_catchup_timeout;
        while Instant::now() < deadline && !self.cancel.is_cancelled() {
            let master_state = self.get_host_state(master).await;
            if !master_state.ping_ok {
                return Err(anyhow!(
                    "waitForCatchup: {master} died while waiting for catchup on {host}"
                ));
            }
            let state = self.get_host_state(host).await;
            if !state.ping_ok {
                return Err(anyhow!(
                    "waitForCatchup: replica {host} died while waiting for catchup from {master}"
                ));
            }
            let Some(replica_state) = &state.replica_state else {
                warn!("WaitForCatchup: {host} has invalid replica state");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            };
            let master_offset = if master_state.is_master {
                master_state.master_replication_offset
            } else if let Some(rs) = &master_state.replica_state {
                rs.replication_offset
            } else {
                warn!("WaitForCatchup: {master} has invalid replica state");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            };
            if master_offset <= replica_state.replication_offset {
                return Ok(());
            }
            info!(
                "WaitForCatchup: waiting for {host} (offset={}) to catchup with {master} (offset={master_offset})",
                replica_state.replication_offset
            );
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Err(anyhow!("timeout waiting for {host} to catchup with {master}"))
    }

    /// Issues one promotion attempt appropriate for the mode.
    pub(crate) async fn promote(
        &self,
        master: &str,
        old_master: &str,
        shard_state: &ShardStateMap,
        force_deadline: Instant,
    ) -> Result<()> {
        let node = self
            .shard
            .get(master)
            .ok_or_else(|| anyhow!("{master} is not in the shard registry"))?;

        if shard_state.get(master).is_some_and(|s| s.is_master) {
            info!("{master} is already master");
            return Ok(());
        }

        match self.config.mode {
            EngineMode::Sentinel => node.sentinel_promote().await.map_err(Into::into),
            EngineMode::Cluster => {
                if shard_state.get(old_master).is_some_and(|s| s.ping_ok)
                    && Instant::now() < force_deadline
                {
                    info!("Old master alive. Using FORCE to promote");
                    return node.cluster_promote_force().await.map_err(Into::into);
                }
                let majority_alive = match node.is_cluster_majority_alive().await {
                    Ok(alive) => alive,
                    Err(err) => {
                        warn!(
                            "New master is not able to check cluster majority state. Assuming that majority is alive: {err}"
                        );
                        true
                    }
                };
                if majority_alive {
                    info!("Majority of master nodes in cluster alive. Using FORCE to promote");
                    return node.cluster_promote_force().await.map_err(Into::into);
                }
                info!(
                    "Old master is dead and majority of master nodes in cluster dead. Using TAKEOVER to promote"
                );
                node.cluster_promote_takeover().await.map_err(Into::into)
            }
        }
    }
}
