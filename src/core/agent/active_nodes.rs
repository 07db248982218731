// src/core/agent/active_nodes.rs

//! Maintenance of the `active_nodes` list: the monotonic two-step write and
//! the quorum-replicas reconciliation that goes with it.

use anyhow::{Result, anyhow};
use tracing::{debug, error};

use super::Agent;
use crate::core::dcs::{self, DcsError};
use crate::core::topology::{self, ActiveNodesContext};
use crate::core::types::{PATH_ACTIVE_NODES, ShardStateMap};

impl Agent {
    /// Active nodes list from the DCS; empty when unset.
    pub async fn get_active_nodes(&self) -> Result<Vec<String>> {
        match dcs::get_json::<Vec<String>>(self.dcs.as_ref(), PATH_ACTIVE_NODES).await {
            Ok(nodes) => Ok(nodes),
            Err(DcsError::NotFound) => Ok(Vec::new()),
            Err(err) => Err(anyhow!("get active nodes from dcs: {err}")),
        }
    }

    /// Aligns the master's quorum-replicas list with the active set.
    pub(crate) async fn actualize_quorum_replicas(
        &self,
        master: &str,
        active_nodes: &[String],
    ) -> Result<()> {
        let node = self
            .shard
            .get(master)
            .ok_or_else(|| anyhow!("{master} is not in the shard registry"))?;
        let port = self.config.engine.port;
        let mut expected: Vec<String> = Vec::new();
        for host in active_nodes {
            if host == master {
                continue;
            }
            expected.push(format!("{host}:{port}"));
            if let Some(active_node) = self.shard.get(host) {
                for ip in active_node.get_ips() {
                    expected.push(format!("{ip}:{port}"));
                }
            }
        }
        expected.sort_unstable();
        let expected_value = expected.join(" ");
        let current_value = node.get_quorum_replicas().await?;
        if current_value != expected_value {
            debug!("Setting quorum replicas to {expected_value} on {master}");
            let rewrite = node.set_quorum_replicas(&expected_value).await?;
            if let Err(err) = rewrite {
                error!("Unable to rewrite config on {master}: {err}");
            }
        }
        Ok(())
    }

    /// Recomputes and writes the active set. Additions are first written
    /// merged with the previous members so writers never observe a shrunken
    /// quorum mid-update, then the canonical value is written.
    pub(crate) async fn update_active_nodes(
        &mut self,
        shard_state: &ShardStateMap,
        shard_state_dcs: &ShardStateMap,
        old_active_nodes: &[String],
        master: &str,
    ) -> Result<()> {
        let master_identities = self
            .shard
            .get(master)
            .map(|node| node.identities())
            .unwrap_or_default();
        let ctx = ActiveNodesContext {
            master,
            master_identities: &master_identities,
            inactivation_delay: self.config.inactivation_delay,
        };
        let active_nodes = topology::calc_active_nodes(
            shard_state,
            shard_state_dcs,
            old_active_nodes,
            &ctx,
            &mut self.runtime.node_fail_time,
        );

        let add_nodes: Vec<String> = active_nodes
            .iter()
            .filter(|node| !old_active_nodes.contains(*node))
            .cloned()
            .collect();
        if !add_nodes.is_empty() {
            let mut merged = add_nodes;
            merged.extend_from_slice(old_active_nodes);
            dcs::set_json(self.dcs.as_ref(), PATH_ACTIVE_NODES, &merged)
                .await
                .map_err(|err| {
                    anyhow!("update active nodes: failed to update active nodes in dcs: {err}")
                })?;
        }

        self.actualize_quorum_replicas(master, &active_nodes)
            .await
            .map_err(|err| {
                anyhow!("update active nodes: failed to actualize quorum replicas: {err}")
            })?;

        dcs::set_json(self.dcs.as_ref(), PATH_ACTIVE_NODES, &active_nodes)
            .await
            .map_err(|err| {
                anyhow!("update active nodes: failed to update active nodes in dcs: {err}")
            })?;
        Ok(())
    }
}
