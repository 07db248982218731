// src/core/agent/manager.rs

//! The manager shard-tick: the only code path allowed to mutate shared DCS
//! state, executed while holding the manager lock.

use std::time::Instant;
use tracing::{error, info};

use super::{Agent, AgentState};
use crate::core::dcs::{self, DcsError};
use crate::core::types::{PATH_CURRENT_SWITCH, PATH_MANAGER_LOCK, Switchover, SwitchoverCause};

impl Agent {
    pub(crate) async fn state_manager(&mut self) -> AgentState {
        if !self.dcs.is_connected() {
            return AgentState::Lost;
        }
        if !self.dcs.acquire_lock(PATH_MANAGER_LOCK).await {
            return AgentState::Candidate;
        }

        if let Err(err) = self.shard.update_hosts_info().await {
            error!("Updating hosts info failed: {err}");
        }

        let shard_state = match self.get_shard_state_from_db().await {
            Ok(state) => state,
            Err(err) => {
                error!("Failed to get shard state from DB: {err}");
                return AgentState::Manager;
            }
        };
        let shard_state_dcs = match self.get_shard_state_from_dcs().await {
            Ok(state) => state,
            Err(err) => {
                error!("Failed to get shard state from DCS: {err}");
                return AgentState::Manager;
            }
        };

        let master = match self.get_current_master(&shard_state).await {
            Ok(master) => master,
            Err(err) => {
                error!("Failed to get or identify master: {err}");
                return AgentState::Manager;
            }
        };

        let active_nodes = match self.get_active_nodes().await {
            Ok(nodes) => nodes,
            Err(err) => {
                error!("Failed to get active nodes: {err}");
                return AgentState::Manager;
            }
        };
        info!("Active nodes: {active_nodes:?}");
        info!("Master: {master}");

        match self.get_maintenance().await {
            Err(err) => {
                error!("Failed to get maintenance from dcs: {err}");
                return AgentState::Manager;
            }
            Ok(Some(mut maintenance)) => {
                if !maintenance.shardkeeper_paused {
                    info!("Entering maintenance");
                    if let Err(err) = self.enter_maintenance(&mut maintenance, &master).await {
                        error!("Unable to enter maintenance: {err}");
                        return AgentState::Manager;
                    }
                }
                return AgentState::Maintenance;
            }
            Ok(None) => {}
        }

        let update_active = self.repair_local_node(&shard_state, &master).await;

        match dcs::get_json::<Switchover>(self.dcs.as_ref(), PATH_CURRENT_SWITCH).await {
            Ok(mut switchover) => {
                if let Err(err) = self.approve_switchover(&switchover, &active_nodes, &shard_state)
                {
                    error!("Unable to perform switchover: {err}");
                    if let Err(finish_err) =
                        self.finish_switchover(&mut switchover, Some(&err)).await
                    {
                        error!("Failed to reject switchover: {finish_err}");
                    }
                    return AgentState::Manager;
                }
                if let Err(err) = self.start_switchover(&mut switchover).await {
                    error!("Unable to start switchover: {err}");
                    return AgentState::Manager;
                }
                let started = Instant::now();
                let cause = switchover.cause;
                let result = self
                    .perform_switchover(&shard_state, &active_nodes, &mut switchover, &master)
                    .await;
                if matches!(
                    self.dcs.get(PATH_CURRENT_SWITCH).await,
                    Err(DcsError::NotFound)
                ) {
                    error!("Switchover was aborted");
                } else {
                    match result {
                        Err(err) => {
                            if let Err(fail_err) = self.fail_switchover(&mut switchover, &err).await
                            {
                                error!("Failed to report switchover failure: {fail_err}");
                            }
                        }
                        Ok(()) => {
                            if let Err(finish_err) =
                                self.finish_switchover(&mut switchover, None).await
                            {
                                error!("Failed to report switchover finish: {finish_err}");
                            } else if let Some(reporter) = &self.reporter {
                                let event = if cause == SwitchoverCause::Auto {
                                    "failover"
                                } else {
                                    "switchover"
                                };
                                reporter.report_timing(event, started.elapsed());
                            }
                        }
                    }
                }
                return AgentState::Manager;
            }
            Err(DcsError::NotFound) => {}
            Err(err) => {
                error!("Getting current switchover failed: {err}");
                return AgentState::Manager;
            }
        }

        match self.get_poison_pill().await {
            Ok(Some(pill)) if pill.applied => {
                if let Err(err) = self.clear_poison_pill().await {
                    error!("Manager: failed to remove poison pill from DCS: {err}");
                    return AgentState::Manager;
                }
            }
            Ok(_) => {}
            Err(err) => {
                error!("Manager: failed to get poison pill from DCS: {err}");
                return AgentState::Manager;
            }
        }

        // master-failure detector: either only our poll lost it while the
        // peers are demonstrably around, or both views agree it is gone
        let db_master_ok = shard_state.get(&master).is_some_and(|s| s.ping_ok);
        let dcs_master_ok = shard_state_dcs.get(&master).is_some_and(|s| s.ping_ok);
        let dcs_master_offline = shard_state_dcs.get(&master).is_some_and(|s| s.is_offline);
        let peers_total = shard_state.len().saturating_sub(1);
        let peers_alive = shard_state
            .iter()
            .filter(|(host, state)| *host != &master && state.ping_ok)
            .count();
        let master_failed = (!db_master_ok && dcs_master_ok && peers_alive * 2 > peers_total)
            || (!db_master_ok && !dcs_master_ok)
            || dcs_master_offline;
        if master_failed {
            error!("Master {master} failure");
            self.runtime
                .node_fail_time
                .entry(master.clone())
                .or_insert_with(Instant::now);
            match self
                .approve_failover(&shard_state, &active_nodes, &master)
                .await
            {
                Ok(()) => {
                    info!("Failover approved");
                    if let Err(err) = self.perform_failover(&master).await {
                        error!("Unable to perform failover: {err}");
                    }
                }
                Err(err) => error!("Failover was not approved: {err}"),
            }
            return AgentState::Manager;
        }

        // split-brain guard: local view says majority is down while the
        // peers' own health records say majority is up
        let hosts_total = shard_state.len();
        if hosts_total > 2 {
            let db_down = shard_state.values().filter(|s| !s.ping_ok).count();
            let dcs_up = shard_state_dcs.values().filter(|s| s.ping_ok).count();
            if db_down * 2 > hosts_total && dcs_up * 2 > hosts_total {
                let since = *self
                    .runtime
                    .split_time
                    .entry(master.clone())
                    .or_insert_with(Instant::now);
                if since.elapsed() > self.config.engine.failover_timeout {
                    error!(
                        "Majority of shard is down for us but alive in DCS, giving up the manager lock"
                    );
                    self.runtime.split_time.remove(&master);
                    if let Err(err) = self.dcs.release_lock(PATH_MANAGER_LOCK).await {
                        error!("Failed to release manager lock: {err}");
                    }
                    return AgentState::Candidate;
                }
            } else {
                self.runtime.split_time.remove(&master);
            }
        }

        if !db_master_ok {
            error!("Master {master} probably failed, do not perform any kind of repair");
            return AgentState::Manager;
        }
        self.runtime.node_fail_time.remove(&master);
        self.repair_shard(&shard_state, &active_nodes, &master).await;

        if update_active {
            if let Err(err) = self
                .update_active_nodes(&shard_state, &shard_state_dcs, &active_nodes, &master)
                .await
            {
                error!("Failed to update active nodes in dcs: {err}");
            }
        }

        AgentState::Manager
    }
}
