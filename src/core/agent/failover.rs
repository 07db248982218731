// src/core/agent/failover.rs

//! Automatic failover approval and initiation.

use anyhow::{Result, anyhow};
use chrono::Utc;
use tracing::info;

use super::Agent;
use crate::core::dcs::{self, DcsError};
use crate::core::topology;
use crate::core::types::{
    PATH_CURRENT_SWITCH, PATH_LAST_SWITCH, ShardStateMap, Switchover, SwitchoverCause,
};

impl Agent {
    pub(crate) fn get_failover_quorum(&self, active_nodes: &[String]) -> usize {
        topology::failover_quorum(active_nodes.len(), self.config.engine.allow_data_loss)
    }

    /// Schedules an automatic failover away from `master` by creating the
    /// switchover record.
    pub(crate) async fn perform_failover(&self, master: &str) -> Result<()> {
        let switchover = Switchover {
            from: master.to_string(),
            initiated_by: self.config.hostname.clone(),
            initiated_at: Utc::now(),
            cause: SwitchoverCause::Auto,
            ..Switchover::default()
        };
        dcs::create_json(self.dcs.as_ref(), PATH_CURRENT_SWITCH, &switchover)
            .await
            .map_err(Into::into)
    }

    /// Gatekeeper for automatic failovers: failure must have lasted past the
    /// failover timeout, the outage must not look like a DCS-side problem,
    /// quorum must hold and the auto-failover cooldown must have elapsed.
    pub(crate) async fn approve_failover(
        &self,
        shard_state: &ShardStateMap,
        active_nodes: &[String],
        master: &str,
    ) -> Result<()> {
        if !self.config.engine.failover_timeout.is_zero() {
            if let Some(failed_at) = self.runtime.node_fail_time.get(master) {
                let failed_time = failed_at.elapsed();
                if failed_time < self.config.engine.failover_timeout {
                    return Err(anyhow!(
                        "failover timeout is not yet elapsed: remaining {:?}",
                        self.config.engine.failover_timeout - failed_time
                    ));
                }
            }
        }
        if topology::count_running_ha_replicas(shard_state) == shard_state.len() - 1 {
            return Err(anyhow!(
                "all replicas are alive and running replication, seems dcs problems"
            ));
        }

        info!("Approve failover: active nodes are {active_nodes:?}");
        let permissible_replicas =
            topology::count_alive_ha_replicas_within_nodes(active_nodes, shard_state);
        let failover_quorum = self.get_failover_quorum(active_nodes);
        if permissible_replicas < failover_quorum {
            return Err(anyhow!(
                "no quorum, have {permissible_replicas} replicas while {failover_quorum} is required"
            ));
        }

        match dcs::get_json::<Switchover>(self.dcs.as_ref(), PATH_LAST_SWITCH).await {
            Err(DcsError::NotFound) => {}
            Err(err) => return Err(err.into()),
            Ok(last_switchover) => {
                let Some(result) = &last_switchover.result else {
                    return Err(anyhow!(
                        "another switchover with cause {} is in progress",
                        last_switchover.cause
                    ));
                };
                let since_last = Utc::now().signed_duration_since(result.finished_at);
                let cooldown = chrono::Duration::from_std(self.config.engine.failover_cooldown)
                    .unwrap_or(chrono::Duration::MAX);
                if since_last < cooldown && last_switchover.cause == SwitchoverCause::Auto {
                    return Err(anyhow!(
                        "not enough time from last failover {} (cooldown {:?})",
                        result.finished_at,
                        self.config.engine.failover_cooldown
                    ));
                }
            }
        }
        Ok(())
    }
}
