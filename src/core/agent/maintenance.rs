// src/core/agent/maintenance.rs

//! Maintenance mode: an operator-managed pause marker under which the agent
//! performs no topology work.

use anyhow::{Result, anyhow};
use tracing::{error, info};

use super::{Agent, AgentState};
use crate::core::dcs::{self, DcsError};
use crate::core::types::{
    Maintenance, PATH_ACTIVE_NODES, PATH_MAINTENANCE, PATH_MANAGER_LOCK,
};

impl Agent {
    /// Current maintenance record from the DCS, if any.
    pub async fn get_maintenance(&self) -> Result<Option<Maintenance>> {
        match dcs::get_json::<Maintenance>(self.dcs.as_ref(), PATH_MAINTENANCE).await {
            Ok(maintenance) => Ok(Some(maintenance)),
            Err(DcsError::NotFound) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Manager-side entry: let the master accept writes without any quorum,
    /// drop the active set and mark the pause as effective.
    pub(crate) async fn enter_maintenance(
        &self,
        maintenance: &mut Maintenance,
        master: &str,
    ) -> Result<()> {
        let node = self
            .shard
            .get(master)
            .ok_or_else(|| anyhow!("{master} is not in the shard registry"))?;
        let rewrite = node.set_num_quorum_replicas(0).await?;
        rewrite?;
        match self.dcs.delete(PATH_ACTIVE_NODES).await {
            Ok(()) | Err(DcsError::NotFound) => {}
            Err(err) => return Err(err.into()),
        }
        maintenance.shardkeeper_paused = true;
        dcs::set_json(self.dcs.as_ref(), PATH_MAINTENANCE, maintenance)
            .await
            .map_err(Into::into)
    }

    /// Manager-side leave: re-identify the master, rebuild the active set
    /// from scratch, repair the shard and drop the record.
    pub(crate) async fn leave_maintenance(&mut self) -> Result<()> {
        self.shard.update_hosts_info().await?;
        let state = self.get_shard_state_from_db().await?;
        let master = self.ensure_current_master(&state).await?;
        let state_dcs = self.get_shard_state_from_dcs().await?;
        let state = self.get_shard_state_from_db().await?;
        self.update_active_nodes(&state, &state_dcs, &[], &master)
            .await?;
        let active_nodes = self.get_active_nodes().await?;
        if active_nodes.is_empty() {
            return Err(anyhow!("no active nodes"));
        }
        self.repair_shard(&state, &active_nodes, &master).await;
        self.dcs.delete(PATH_MAINTENANCE).await.map_err(Into::into)
    }

    pub(crate) fn create_maintenance_file(&self) {
        if let Err(err) = std::fs::write(&self.config.maintenance_file, b"") {
            error!("Failed to write maintenance file: {err}");
        }
    }

    pub(crate) fn maintenance_file_exists(&self) -> bool {
        std::path::Path::new(&self.config.maintenance_file).exists()
    }

    pub(crate) fn remove_maintenance_file(&self) {
        if let Err(err) = std::fs::remove_file(&self.config.maintenance_file) {
            if err.kind() != std::io::ErrorKind::NotFound {
                error!("Failed to remove maintenance file: {err}");
            }
        }
    }

    pub(crate) async fn state_maintenance(&mut self) -> AgentState {
        if !self.maintenance_file_exists() {
            self.create_maintenance_file();
        }
        let maintenance = match self.get_maintenance().await {
            Ok(maintenance) => maintenance,
            Err(_) => return AgentState::Maintenance,
        };
        let should_leave = match &maintenance {
            None => true,
            Some(m) => m.should_leave,
        };
        if should_leave {
            if self.dcs.acquire_lock(PATH_MANAGER_LOCK).await {
                info!("Leaving maintenance");
                if let Err(err) = self.leave_maintenance().await {
                    error!("Failed to leave maintenance: {err}");
                    return AgentState::Maintenance;
                }
                self.remove_maintenance_file();
                return AgentState::Manager;
            }
            self.remove_maintenance_file();
            return AgentState::Candidate;
        }
        AgentState::Maintenance
    }
}
