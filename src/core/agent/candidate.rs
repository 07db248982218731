// src/core/agent/candidate.rs

//! The Candidate state: a healthy agent without the manager lock. Keeps the
//! local node repaired, honors fencing, and contends for the lock.

use tracing::error;

use super::{Agent, AgentState};
use crate::core::dcs::{self, DcsError};
use crate::core::types::{PATH_MANAGER_LOCK, PATH_MASTER_NODE, ShardStateMap};

impl Agent {
    pub(crate) async fn state_candidate(&mut self) -> AgentState {
        if !self.dcs.is_connected() {
            return AgentState::Lost;
        }
        if let Err(err) = self.shard.update_hosts_info().await {
            error!("Candidate: failed to update host info from DCS: {err}");
            return AgentState::Candidate;
        }
        let shard_state = match self.get_shard_state_from_db().await {
            Ok(state) => state,
            Err(err) => {
                error!("Failed to get shard state from DB: {err}");
                ShardStateMap::new()
            }
        };

        match self.get_maintenance().await {
            Err(err) => {
                error!("Candidate: failed to get maintenance from DCS: {err}");
                return AgentState::Candidate;
            }
            Ok(Some(maintenance)) if maintenance.shardkeeper_paused => {
                return AgentState::Maintenance;
            }
            Ok(_) => {}
        }

        match self.get_poison_pill().await {
            Err(err) => {
                error!("Candidate: failed to get poison pill from DCS: {err}");
                return AgentState::Candidate;
            }
            Ok(Some(pill)) => {
                if let Err(err) = self.apply_poison_pill(&pill).await {
                    error!("Candidate: failed to apply poison pill: {err}");
                    return AgentState::Candidate;
                }
                if pill.target_host == self.config.hostname {
                    return AgentState::Candidate;
                }
            }
            Ok(None) => {}
        }

        let master = match dcs::get_json::<String>(self.dcs.as_ref(), PATH_MASTER_NODE).await {
            Ok(master) => master,
            Err(DcsError::NotFound) => String::new(),
            Err(err) => {
                error!("Candidate: failed to get current master from DCS: {err}");
                return AgentState::Candidate;
            }
        };
        self.repair_local_node(&shard_state, &master).await;

        if self.dcs.acquire_lock(PATH_MANAGER_LOCK).await {
            return AgentState::Manager;
        }
        AgentState::Candidate
    }
}
