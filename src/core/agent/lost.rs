// src/core/agent/lost.rs

//! The Lost state: the DCS session is gone. The local node goes offline
//! unless the shard demonstrably keeps running around it.

use tracing::{error, info};

use super::{Agent, AgentState};
use crate::core::topology::{self, LagBound};

impl Agent {
    pub(crate) async fn state_lost(&mut self) -> AgentState {
        if self.dcs.is_connected() {
            return AgentState::Candidate;
        }
        if self.shard.hosts().len() == 1 {
            return AgentState::Lost;
        }

        let Some(local_state) = self.get_local_state().await else {
            return AgentState::Lost;
        };
        let Some(node) = self.shard.local() else {
            return AgentState::Lost;
        };

        if local_state.is_master {
            if self.check_ha_replicas_running().await {
                let offline = match node.is_offline().await {
                    Ok(offline) => offline,
                    Err(err) => {
                        error!("Failed to get node offline state for {}: {err}", node.fqdn());
                        return AgentState::Lost;
                    }
                };
                if offline {
                    info!(
                        "Lost DCS connection. However HA cluster is live. Setting local node online"
                    );
                    if let Err(err) = node.set_online().await {
                        error!("Unable to set local node online: {err}");
                    }
                    return AgentState::Lost;
                }
                info!("Lost DCS connection. However HA cluster is live. Do nothing");
                return AgentState::Lost;
            }
        } else {
            // replica: stay open only with a live, stable master, a healthy
            // link to it and no staleness
            let shard_state = match self.get_shard_state_from_db().await {
                Ok(state) => state,
                Err(err) => {
                    error!("Failed to get shard state from DB: {err}");
                    return self.go_offline(&node).await;
                }
            };
            let master = match self.get_master_host(&shard_state).await {
                Ok(master) => master,
                Err(err) => {
                    error!("Failed to identify master: {err}");
                    return self.go_offline(&node).await;
                }
            };
            let master_alive = shard_state
                .get(&master)
                .is_some_and(|state| state.ping_ok && state.ping_stable);
            let link_healthy = local_state
                .replica_state
                .as_ref()
                .is_some_and(|rs| rs.master_link_state);
            let stale = topology::is_replica_stale(
                &local_state,
                self.config.engine.stale_replica_lag_close,
                self.runtime.dcs_diverge_time.map(|at| at.elapsed()),
                LagBound::Close,
            );
            if master_alive && link_healthy && !stale {
                let offline = match node.is_offline().await {
                    Ok(offline) => offline,
                    Err(err) => {
                        error!("Failed to get node offline state for {}: {err}", node.fqdn());
                        return AgentState::Lost;
                    }
                };
                if offline {
                    info!("Lost DCS connection, but replication is healthy. Setting local node online");
                    if let Err(err) = node.set_online().await {
                        error!("Unable to set local node online: {err}");
                    }
                }
                return AgentState::Lost;
            }
        }

        self.go_offline(&node).await
    }

    async fn go_offline(&self, node: &std::sync::Arc<crate::core::engine::Node>) -> AgentState {
        let offline = match node.is_offline().await {
            Ok(offline) => offline,
            Err(err) => {
                error!("Failed to get node offline state for {}: {err}", node.fqdn());
                return AgentState::Lost;
            }
        };
        if offline {
            return AgentState::Lost;
        }
        if let Err(err) = node.set_offline().await {
            error!("Failed to set node {} offline: {err}", node.fqdn());
            return AgentState::Lost;
        }
        info!("Lost DCS connection. Node {} is now offline", node.fqdn());
        AgentState::Lost
    }
}
