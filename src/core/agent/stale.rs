// src/core/agent/stale.rs

//! Stale-replica self-closing: a lagging replica takes itself offline so
//! readers never observe arbitrarily old data, and re-opens with hysteresis.

use std::time::Instant;
use tracing::{error, info, warn};

use super::Agent;
use crate::config::EngineMode;
use crate::core::dcs::DcsError;
use crate::core::topology::{self, LagBound};
use crate::core::types::{HostState, PATH_CURRENT_SWITCH};

impl Agent {
    /// Takes the local replica offline when it lags past the close bound
    /// while the master and a majority of peers remain healthy.
    ///
    /// Cluster mode only, and only for replicas holding no slots: a slot
    /// owner going dark would take part of the keyspace with it.
    pub(crate) async fn close_stale_replica(&mut self, master: &str, local_state: &HostState) {
        if self.config.mode != EngineMode::Cluster {
            return;
        }
        let Some(local) = self.shard.local() else {
            return;
        };
        if local.fqdn() == master || local_state.is_master {
            self.runtime.dcs_diverge_time = None;
            self.runtime.repl_fail_time = None;
            return;
        }
        match local.has_cluster_slots().await {
            Ok(false) => {}
            Ok(true) => return,
            Err(err) => {
                error!("Unable to check local slots for stale close: {err}");
                return;
            }
        }

        // divergence timer runs while the replica substate is missing
        if local_state.replica_state.is_none() {
            self.runtime.dcs_diverge_time.get_or_insert_with(Instant::now);
        } else {
            self.runtime.dcs_diverge_time = None;
        }

        let diverge_elapsed = self.runtime.dcs_diverge_time.map(|at| at.elapsed());
        let stale = topology::is_replica_stale(
            local_state,
            self.config.engine.stale_replica_lag_close,
            diverge_elapsed,
            LagBound::Close,
        );
        if !stale {
            self.runtime.repl_fail_time = None;
            return;
        }
        self.runtime.repl_fail_time.get_or_insert_with(Instant::now);

        let shard_state_dcs = match self.get_shard_state_from_dcs().await {
            Ok(state) => state,
            Err(err) => {
                error!("Stale close: failed to get shard state from DCS: {err}");
                return;
            }
        };
        let master_healthy = shard_state_dcs
            .get(master)
            .is_some_and(|state| state.ping_ok && state.ping_stable && !state.is_offline);
        if !master_healthy {
            info!("Stale close: master is not demonstrably healthy, keeping local open");
            return;
        }

        let mut ok_peers = 0usize;
        let mut stale_peers = 0usize;
        for (host, state) in &shard_state_dcs {
            if host == local.fqdn() || host == master {
                continue;
            }
            let peer_stale = topology::is_replica_stale(
                state,
                self.config.engine.stale_replica_lag_close,
                None,
                LagBound::Close,
            );
            if peer_stale {
                stale_peers += 1;
            } else {
                ok_peers += 1;
            }
        }
        if ok_peers < stale_peers {
            info!("Stale close: majority of peers are stale too, keeping local open");
            return;
        }

        match self.dcs.get(PATH_CURRENT_SWITCH).await {
            Err(DcsError::NotFound) => {}
            Ok(_) => {
                info!("Stale close: switchover in progress, keeping local open");
                return;
            }
            Err(err) => {
                error!("Stale close: unable to check for running switchover: {err}");
                return;
            }
        }

        warn!(
            "Local replica lags past the close bound ({:?}), going offline",
            self.config.engine.stale_replica_lag_close
        );
        if let Err(err) = local.set_offline().await {
            error!("Unable to set stale local replica offline: {err}");
        }
    }

    /// Runs the configured destructive replication repair command, bounded by
    /// its timeout. Returns true when the replica may be re-opened.
    pub(crate) async fn run_destructive_replication_repair(&self) -> bool {
        let command = &self.config.engine.destructive_replication_repair_command;
        if command.is_empty() {
            return false;
        }
        let mut parts = command.split_whitespace();
        let Some(program) = parts.next() else {
            return false;
        };
        warn!("Running destructive replication repair: {command}");
        let run = tokio::process::Command::new(program)
            .args(parts)
            .status();
        match tokio::time::timeout(
            self.config.engine.destructive_replication_repair_timeout,
            run,
        )
        .await
        {
            Ok(Ok(status)) if status.success() => true,
            Ok(Ok(status)) => {
                error!("Destructive replication repair exited with {status}");
                false
            }
            Ok(Err(err)) => {
                error!("Destructive replication repair failed to start: {err}");
                false
            }
            Err(_) => {
                error!("Destructive replication repair timed out");
                false
            }
        }
    }
}
