// src/core/agent/switchover.rs

//! Switchover record lifecycle and the phased, resumable orchestration that
//! moves the master role between hosts.

use anyhow::{Result, anyhow};
use chrono::Utc;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use super::Agent;
use super::snapshot::combine_errors;
use crate::core::dcs::{self, DcsError};
use crate::core::topology;
use crate::core::types::{
    PATH_ACTIVE_NODES, PATH_CURRENT_SWITCH, PATH_LAST_REJECTED_SWITCH, PATH_LAST_SWITCH,
    PATH_MASTER_NODE, ShardStateMap, Switchover, SwitchoverCause, SwitchoverProgress,
    SwitchoverResult,
};

pub(crate) const SWITCHOVER_VERSION: u32 = 1;

/// Awaits per-host futures concurrently and returns the full result map.
/// No host is aborted on the first failure.
async fn join_parallel<F, Fut>(hosts: &[String], operation: F) -> HashMap<String, Result<()>>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let futures = hosts.iter().map(|host| {
        let future = operation(host.clone());
        async move { (host.clone(), future.await) }
    });
    futures::future::join_all(futures).await.into_iter().collect()
}

impl Agent {
    /// The most recently finished switchover, successful or rejected.
    pub async fn get_last_switchover(&self) -> Option<Switchover> {
        let last = match dcs::get_json::<Switchover>(self.dcs.as_ref(), PATH_LAST_SWITCH).await {
            Ok(switchover) => Some(switchover),
            Err(DcsError::NotFound) => None,
            Err(err) => {
                error!("{PATH_LAST_SWITCH}: {err}");
                None
            }
        };
        let rejected =
            match dcs::get_json::<Switchover>(self.dcs.as_ref(), PATH_LAST_REJECTED_SWITCH).await {
                Ok(switchover) => Some(switchover),
                Err(DcsError::NotFound) => None,
                Err(err) => {
                    error!("{PATH_LAST_REJECTED_SWITCH}: {err}");
                    None
                }
            };
        match (last, rejected) {
            (Some(last), Some(rejected)) => {
                if rejected.initiated_at > last.initiated_at {
                    Some(rejected)
                } else {
                    Some(last)
                }
            }
            (last, rejected) => last.or(rejected),
        }
    }

    /// First-run approval: enough alive HA replicas within the active set.
    pub(crate) fn approve_switchover(
        &self,
        switchover: &Switchover,
        active_nodes: &[String],
        shard_state: &ShardStateMap,
    ) -> Result<()> {
        if switchover.run_count > 0 {
            return Ok(());
        }
        let permissible_replicas =
            topology::count_alive_ha_replicas_within_nodes(active_nodes, shard_state);
        let failover_quorum = self.get_failover_quorum(active_nodes);
        if permissible_replicas < failover_quorum {
            return Err(anyhow!(
                "no quorum, have {permissible_replicas} replicas while {failover_quorum} is required"
            ));
        }
        Ok(())
    }

    pub(crate) async fn start_switchover(&self, switchover: &mut Switchover) -> Result<()> {
        info!(
            "Switchover: {} => {} starting",
            switchover.from, switchover.to
        );
        switchover.started_at = Some(Utc::now());
        switchover.started_by = self.config.hostname.clone();
        dcs::set_json(self.dcs.as_ref(), PATH_CURRENT_SWITCH, switchover)
            .await
            .map_err(Into::into)
    }

    /// Records a failed run on the current record, keeping it schedulable.
    pub(crate) async fn fail_switchover(
        &self,
        switchover: &mut Switchover,
        err: &anyhow::Error,
    ) -> Result<()> {
        error!(
            "Switchover: {} => {} failed: {err}",
            switchover.from, switchover.to
        );
        switchover.run_count += 1;
        switchover.progress = None;
        switchover.result = Some(SwitchoverResult {
            ok: false,
            error: err.to_string(),
            finished_at: Utc::now(),
        });
        dcs::set_json(self.dcs.as_ref(), PATH_CURRENT_SWITCH, switchover)
            .await
            .map_err(Into::into)
    }

    /// Persists updated progress so a restarted manager can resume mid-flight.
    pub(crate) async fn update_switchover(&self, switchover: &Switchover) -> Result<()> {
        if switchover.progress.is_none() {
            return Err(anyhow!("update switchover without progress is not possible"));
        }
        dcs::set_json(self.dcs.as_ref(), PATH_CURRENT_SWITCH, switchover)
            .await
            .map_err(Into::into)
    }

    /// Moves the record to its historical slot and removes `current_switch`.
    pub(crate) async fn finish_switchover(
        &self,
        switchover: &mut Switchover,
        switch_err: Option<&anyhow::Error>,
    ) -> Result<()> {
        let (ok, action, path) = match switch_err {
            None => (true, "finished", PATH_LAST_SWITCH),
            Some(_) => (false, "rejected", PATH_LAST_REJECTED_SWITCH),
        };
        info!(
            "Switchover: {} => {} {action}",
            switchover.from, switchover.to
        );
        switchover.progress = None;
        switchover.result = Some(SwitchoverResult {
            ok,
            error: switch_err.map(|err| err.to_string()).unwrap_or_default(),
            finished_at: Utc::now(),
        });
        self.dcs.delete(PATH_CURRENT_SWITCH).await?;
        dcs::set_json(self.dcs.as_ref(), path, switchover)
            .await
            .map_err(Into::into)
    }

    /// Ensures a poison pill targets `old_master`, clearing any pill aimed at
    /// a different host first. Non-automatic causes wait for the victim.
    async fn fence_old_master(&self, old_master: &str, cause: SwitchoverCause) -> Result<()> {
        let pill = self
            .get_poison_pill()
            .await
            .map_err(|err| anyhow!("unable to get poison pill: {err}"))?;
        let mut need_issue = true;
        if let Some(pill) = pill {
            if pill.target_host == old_master {
                need_issue = false;
            } else {
                self.clear_poison_pill()
                    .await
                    .map_err(|err| anyhow!("unable to clear stale poison pill: {err}"))?;
            }
        }
        if need_issue {
            self.issue_poison_pill(old_master).await.map_err(|err| {
                anyhow!("unable to issue poison pill for old master {old_master}: {err}")
            })?;
        }
        if cause != SwitchoverCause::Auto {
            self.wait_poison_pill(self.config.engine.wait_poison_pill_timeout)
                .await;
        }
        Ok(())
    }

    /// The phased switchover procedure. Runs inside a critical section: DCS
    /// loss while this executes terminates the process.
    pub(crate) async fn perform_switchover(
        &mut self,
        shard_state: &ShardStateMap,
        active_nodes: &[String],
        switchover: &mut Switchover,
        old_master: &str,
    ) -> Result<()> {
        let _critical = self.enter_critical();

        match &switchover.progress {
            None => {
                switchover.progress = Some(SwitchoverProgress {
                    version: SWITCHOVER_VERSION,
                    phase: 1,
                    ..SwitchoverProgress::default()
                });
                self.update_switchover(switchover)
                    .await
                    .map_err(|err| anyhow!("setting initial switchover progress: {err}"))?;
            }
            Some(progress) if progress.version != SWITCHOVER_VERSION => {
                return Err(anyhow!(
                    "got incompatible switchover version {} (expected {SWITCHOVER_VERSION})",
                    progress.version
                ));
            }
            Some(_) => {}
        }

        if !switchover.to.is_empty() && !active_nodes.contains(&switchover.to) {
            return Err(anyhow!(
                "switchover: failed: replica {} is not active, can't switch to it",
                switchover.to
            ));
        }

        let failover_quorum = self.get_failover_quorum(active_nodes);

        let active_nodes: Vec<String> =
            if switchover.cause == SwitchoverCause::Auto && switchover.from == old_master {
                active_nodes
                    .iter()
                    .filter(|host| host.as_str() != old_master)
                    .cloned()
                    .collect()
            } else {
                active_nodes.to_vec()
            };

        info!("Switchover: phase 1: make all shard nodes read-only");

        let errs_ro = join_parallel(&active_nodes, |host| {
            let shard = self.shard.clone();
            let ping_ok = shard_state.get(&host).is_some_and(|s| s.ping_ok);
            let disconnect = host == old_master;
            async move {
                if !ping_ok {
                    let err = anyhow!("host {host} is not healthy");
                    error!("Setting read-only: {err}");
                    return Err(err);
                }
                let node = shard
                    .get(&host)
                    .ok_or_else(|| anyhow!("{host} is not in the shard registry"))?;
                match node.set_read_only(disconnect).await {
                    Ok(rewrite) => {
                        if let Err(rewrite_err) = rewrite {
                            warn!(
                                "Unable to rewrite config after making {host} read-only: {rewrite_err}"
                            );
                        }
                        info!("Switchover: host {host} is read-only");
                        Ok(())
                    }
                    Err(err) => {
                        error!("Setting {host} read-only: {err}");
                        Err(err.into())
                    }
                }
            }
        })
        .await;

        if let Some(Err(err)) = errs_ro.get(old_master) {
            if shard_state.get(old_master).is_some_and(|s| s.ping_ok) {
                let err = anyhow!("failed to set old master {old_master} read-only: {err}");
                error!("Switchover: {err}");
                self.finish_switchover(switchover, Some(&err))
                    .await
                    .map_err(|finish_err| anyhow!("failed to reject switchover {finish_err}"))?;
                info!("Switchover: rejected");
                return Err(err);
            }
        }

        if !shard_state.get(old_master).is_some_and(|s| s.ping_ok) {
            self.fence_old_master(old_master, switchover.cause).await?;
        }

        info!("Switchover: phase 2: stop replication");

        let turn_before_switchover = self.config.engine.turn_before_switchover;
        let errs_pause = join_parallel(&active_nodes, |host| {
            let shard = self.shard.clone();
            let state = shard_state.get(&host).cloned();
            async move {
                let Some(state) = state else {
                    return Err(anyhow!("host {host} is not in the shard state"));
                };
                if !state.ping_ok {
                    let err = anyhow!("host {host} is not healthy");
                    error!("Pausing replication: {err}");
                    return Err(err);
                }
                let link_up = state
                    .replica_state
                    .as_ref()
                    .is_some_and(|rs| rs.master_link_state);
                if !link_up && !turn_before_switchover {
                    info!("Switchover: skipping replication pause on {host}");
                    return Ok(());
                }
                let node = shard
                    .get(&host)
                    .ok_or_else(|| anyhow!("{host} is not in the shard registry"))?;
                match node.pause_replication().await {
                    Ok(rewrite) => {
                        if let Err(rewrite_err) = rewrite {
                            warn!("Unable to rewrite config after pausing {host}: {rewrite_err}");
                        }
                        info!("Switchover: replication on {host} is now paused");
                        Ok(())
                    }
                    Err(err) => {
                        error!("Pausing replication on {host}: {err}");
                        Err(err.into())
                    }
                }
            }
        })
        .await;

        let alive_active_nodes: Vec<String> = active_nodes
            .iter()
            .filter(|host| {
                errs_ro.get(*host).is_some_and(|r| r.is_ok())
                    && errs_pause.get(*host).is_some_and(|r| r.is_ok())
            })
            .cloned()
            .collect();

        if alive_active_nodes.len() < failover_quorum {
            return Err(anyhow!(
                "no failover quorum reached: {} nodes alive, {failover_quorum} required",
                alive_active_nodes.len()
            ));
        }

        info!("Switchover: phase 3: find most up-to-date host");

        let states = self
            .get_shard_state_from_db()
            .await
            .map_err(|err| anyhow!("no actual shard state: {err}"))?;

        let progress = switchover.progress.clone().expect("progress set in phase 1");
        let (most_recent, new_master) = if progress.phase >= 3 {
            (progress.most_recent.clone(), progress.new_master.clone())
        } else {
            let most_recent = topology::find_most_recent_node(&states)
                .ok_or_else(|| anyhow!("no host with a usable replication offset"))?;
            let new_master = if !switchover.to.is_empty() {
                switchover.to.clone()
            } else if !switchover.from.is_empty() {
                match self.select_most_desirable(&states, &switchover.from).await {
                    Ok(host) => host,
                    Err(err) => {
                        let errs_resume = join_parallel(&active_nodes, |host| {
                            let shard = self.shard.clone();
                            let ping_ok = shard_state.get(&host).is_some_and(|s| s.ping_ok);
                            async move {
                                if !ping_ok {
                                    let err = anyhow!("host {host} is not healthy");
                                    error!("Resume replication: {err}");
                                    return Err(err);
                                }
                                let node = shard
                                    .get(&host)
                                    .ok_or_else(|| anyhow!("{host} is not in the shard registry"))?;
                                node.resume_replication().await.map(|_| ()).map_err(|err| {
                                    error!("Resume replication on {host}: {err}");
                                    err.into()
                                })
                            }
                        })
                        .await;
                        if let Err(combined) = combine_errors(&errs_resume) {
                            error!("Resuming replication after failed selection: {combined}");
                        }
                        return Err(anyhow!("get desirable node for switchover: {err}"));
                    }
                }
            } else {
                most_recent.clone()
            };
            let progress = switchover.progress.as_mut().expect("progress set in phase 1");
            progress.most_recent = most_recent.clone();
            progress.new_master = new_master.clone();
            progress.phase = 3;
            self.update_switchover(switchover)
                .await
                .map_err(|err| anyhow!("setting switchover progress on phase 3: {err}"))?;
            (most_recent, new_master)
        };

        if switchover.progress.as_ref().expect("progress set").phase < 5 {
            info!("Switchover: phase 4: catch up");
            let new_master_offset = states.get(&new_master).map(topology::offset);
            let most_recent_offset = states.get(&most_recent).map(topology::offset);
            if new_master != most_recent && new_master_offset != most_recent_offset {
                self.change_master(&new_master, &most_recent).await?;
                self.wait_for_catchup(&new_master, &most_recent).await?;
            }
        }

        let mut shard_state = self
            .get_shard_state_from_db()
            .await
            .map_err(|err| anyhow!("update shard state during switchover: {err}"))?;
        if !shard_state.get(&new_master).is_some_and(|s| s.ping_ok) {
            return Err(anyhow!(
                "new master {new_master} suddenly became not available during switchover"
            ));
        }

        info!("Switchover: phase 5: promote selected host");

        if switchover.progress.as_ref().expect("progress set").phase != 6 {
            switchover.progress.as_mut().expect("progress set").phase = 5;
            self.update_switchover(switchover)
                .await
                .map_err(|err| anyhow!("setting switchover progress on phase 5: {err}"))?;

            dcs::set_json(self.dcs.as_ref(), PATH_MASTER_NODE, &new_master)
                .await
                .map_err(|err| anyhow!("failed to set new master in dcs: {err}"))?;

            self.fence_old_master(old_master, switchover.cause).await?;

            if alive_active_nodes.len() == 1
                || self.config.engine.allow_data_loss
                || self.config.engine.max_replicas_to_write == 0
            {
                let node = self
                    .shard
                    .get(&new_master)
                    .ok_or_else(|| anyhow!("{new_master} is not in the shard registry"))?;
                let rewrite = node.set_read_write().await.map_err(|err| {
                    anyhow!("unable to set {new_master} available for write before promote: {err}")
                })?;
                rewrite.map_err(|err| {
                    anyhow!("unable to rewrite config on {new_master} before promote: {err}")
                })?;
            }

            if turn_before_switchover {
                let mut psync_nodes: Vec<String> = Vec::new();
                for host in &alive_active_nodes {
                    if host == &new_master {
                        continue;
                    }
                    if !shard_state.get(&new_master).is_some_and(|s| s.is_repl_paused) {
                        warn!(
                            "Unable to psync {host} before promote: replication on new master is not paused"
                        );
                        continue;
                    }
                    let possible = match (shard_state.get(host), shard_state.get(&new_master)) {
                        (Some(replica), Some(master)) => {
                            topology::is_partial_sync_possible(replica, master)
                        }
                        _ => false,
                    };
                    if possible {
                        psync_nodes.push(host.clone());
                    }
                }
                let agent = &*self;
                let turn_errs = join_parallel(&psync_nodes, |host| {
                    let new_master = new_master.clone();
                    let ping_ok = shard_state.get(&host).is_some_and(|s| s.ping_ok);
                    async move {
                        if !ping_ok {
                            return Ok(());
                        }
                        agent.change_master(&host, &new_master).await
                    }
                })
                .await;
                if let Err(err) = combine_errors(&turn_errs) {
                    warn!("Unable to psync some replicas before promote: {err}");
                }
            }

            let deadline = Instant::now() + self.config.engine.wait_promote_timeout;
            let force_deadline = Instant::now() + self.config.engine.wait_promote_force_timeout;
            let mut promoted = false;
            while Instant::now() < deadline && !self.cancel.is_cancelled() {
                self.promote(&new_master, old_master, &shard_state, force_deadline)
                    .await
                    .map_err(|err| anyhow!("promote new master {new_master} failed: {err}"))?;
                tokio::time::sleep(Duration::from_secs(1)).await;
                shard_state = self.get_shard_state_from_db().await.map_err(|err| {
                    anyhow!("update shard state during switchover after promote: {err}")
                })?;
                if shard_state.get(&new_master).is_some_and(|s| s.is_master) {
                    promoted = true;
                    break;
                }
                warn!("Switchover: phase 5: {new_master} is still replica, trying again");
            }
            if !promoted {
                return Err(anyhow!(
                    "promote new master {new_master} failed: deadline reached"
                ));
            }
        }

        switchover.progress.as_mut().expect("progress set").phase = 6;
        self.update_switchover(switchover)
            .await
            .map_err(|err| anyhow!("setting switchover progress on phase 6: {err}"))?;

        info!("Switchover: phase 6: turn replicas");

        let mut psync_active_nodes: Vec<String> = alive_active_nodes
            .iter()
            .filter(|host| {
                if *host == &new_master {
                    return false;
                }
                match (shard_state.get(*host), shard_state.get(&new_master)) {
                    (Some(replica), Some(master)) => {
                        topology::is_partial_sync_possible(replica, master)
                    }
                    _ => false,
                }
            })
            .cloned()
            .collect();
        psync_active_nodes.push(new_master.clone());
        psync_active_nodes.sort_unstable();

        dcs::set_json(self.dcs.as_ref(), PATH_ACTIVE_NODES, &psync_active_nodes)
            .await
            .map_err(|_| anyhow!("unable to update active nodes in dcs: {psync_active_nodes:?}"))?;

        let new_master_node = self
            .shard
            .get(&new_master)
            .ok_or_else(|| anyhow!("{new_master} is not in the shard registry"))?;
        if let Some(new_master_state) = shard_state.get(&new_master) {
            self.repair_master(&new_master_node, &psync_active_nodes, new_master_state)
                .await;
        }

        let agent = &*self;
        let turn_errs = join_parallel(&psync_active_nodes, |host| {
            let new_master = new_master.clone();
            let ping_ok = shard_state.get(&host).is_some_and(|s| s.ping_ok);
            async move {
                if host == new_master || !ping_ok {
                    return Ok(());
                }
                agent.change_master(&host, &new_master).await
            }
        })
        .await;
        combine_errors(&turn_errs)
    }

    /// Loads per-host priorities from the DCS and delegates to the topology
    /// selection rule.
    pub(crate) async fn select_most_desirable(
        &self,
        states: &ShardStateMap,
        switchover_from: &str,
    ) -> Result<String> {
        let mut priorities = HashMap::new();
        for host in states.keys() {
            let nc = self.shard.node_configuration(host).await?;
            priorities.insert(host.clone(), nc.priority);
        }
        topology::most_desirable_node(states, &priorities, switchover_from)
    }
}
