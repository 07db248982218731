// src/core/engine/shard.rs

//! In-process registry of the shard's engine nodes, synced from the DCS.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use super::node::Node;
use crate::config::Config;
use crate::core::dcs::{self, Dcs, DcsError};
use crate::core::types::PATH_HA_NODES;

/// DCS node configuration for an engine host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfiguration {
    /// Host priority to become master. Can be changed via CLI.
    pub priority: i64,
}

impl Default for NodeConfiguration {
    fn default() -> Self {
        Self {
            priority: crate::core::topology::DEFAULT_PRIORITY,
        }
    }
}

/// The set of engine nodes managed together: one master plus replicas.
pub struct Shard {
    config: Arc<Config>,
    dcs: Arc<dyn Dcs>,
    nodes: Mutex<HashMap<String, Arc<Node>>>,
    local: Mutex<Option<Arc<Node>>>,
}

impl Shard {
    pub fn new(config: Arc<Config>, dcs: Arc<dyn Dcs>) -> Arc<Self> {
        Arc::new(Self {
            config,
            dcs,
            nodes: Mutex::new(HashMap::new()),
            local: Mutex::new(None),
        })
    }

    /// Current shard hosts from the DCS membership prefix.
    pub async fn shard_hosts_from_dcs(&self) -> Result<Vec<String>, DcsError> {
        match self.dcs.get_children(PATH_HA_NODES).await {
            Ok(hosts) => Ok(hosts),
            Err(DcsError::NotFound) => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    /// Reads host names from the DCS and updates the registry.
    pub async fn update_hosts_info(&self) -> Result<(), DcsError> {
        let hosts = self.shard_hosts_from_dcs().await?;
        info!("Nodes from DCS: {hosts:?}");

        let missing: Vec<String> = {
            let nodes = self.nodes.lock();
            hosts
                .iter()
                .filter(|host| !nodes.contains_key(*host))
                .cloned()
                .collect()
        };

        let mut created = Vec::with_capacity(missing.len());
        for host in missing {
            let node = Node::new(Arc::clone(&self.config), &host).await;
            created.push((host, node));
        }

        let mut nodes = self.nodes.lock();
        for (host, node) in created {
            if node.is_local() {
                let mut local = self.local.lock();
                if local.is_none() {
                    *local = Some(Arc::clone(&node));
                }
            }
            nodes.insert(host, node);
        }
        // hosts no longer in the DCS leave the registry
        nodes.retain(|host, _| hosts.iter().any(|h| h == host));
        Ok(())
    }

    /// Node by host name.
    pub fn get(&self, host: &str) -> Option<Arc<Node>> {
        self.nodes.lock().get(host).cloned()
    }

    /// Node running on the same host as the current agent process.
    pub fn local(&self) -> Option<Arc<Node>> {
        self.local.lock().clone()
    }

    /// All known hosts, sorted.
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.nodes.lock().keys().cloned().collect();
        hosts.sort_unstable();
        hosts
    }

    /// Operator-set node configuration, falling back to defaults.
    pub async fn node_configuration(&self, host: &str) -> Result<NodeConfiguration, DcsError> {
        let path = dcs::join_path(&[PATH_HA_NODES, host]);
        match dcs::get_json::<NodeConfiguration>(self.dcs.as_ref(), &path).await {
            Ok(nc) => Ok(nc),
            Err(DcsError::NotFound | DcsError::Malformed(_)) => Ok(NodeConfiguration::default()),
            Err(err) => Err(err),
        }
    }
}
