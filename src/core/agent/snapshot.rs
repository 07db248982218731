// src/core/agent/snapshot.rs

//! Parallel collection of per-host states from live engine polls and from
//! peers' health records in the DCS.

use anyhow::{Result, anyhow};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::Agent;
use crate::config::Config;
use crate::core::dcs::{self, Dcs};
use crate::core::engine::Shard;
use crate::core::types::{
    HostState, PATH_HEALTH_PREFIX, READ_ONLY_MIN_REPLICAS, ReplicaState, ShardStateMap,
};

fn parse_i64(info: &HashMap<String, String>, key: &str) -> Result<i64, String> {
    let raw = info.get(key).ok_or_else(|| format!("No {key} in info"))?;
    raw.parse().map_err(|_| format!("Bad {key} in info: {raw}"))
}

/// Extracts the replica addresses a master currently streams to from the
/// `slaveN:ip=...,port=...` info lines.
fn parse_connected_replicas(info: &HashMap<String, String>) -> Vec<String> {
    let mut replicas = Vec::new();
    for (key, value) in info {
        if !key.starts_with("slave") || key[5..].parse::<u32>().is_err() {
            continue;
        }
        let fields: HashMap<&str, &str> = value
            .split(',')
            .filter_map(|pair| pair.split_once('='))
            .collect();
        if let Some(ip) = fields.get("ip") {
            replicas.push((*ip).to_string());
        }
    }
    replicas.sort_unstable();
    replicas
}

/// Builds a full host state from a single info snapshot plus the read-side
/// adapter knobs. Parse errors set `error` but still yield a partial state.
pub(crate) async fn host_state_from_db(
    config: &Arc<Config>,
    shard: &Arc<Shard>,
    fqdn: &str,
) -> HostState {
    let mut state = HostState {
        check_at: Utc::now(),
        check_by: config.hostname.clone(),
        ..HostState::default()
    };
    let Some(node) = shard.get(fqdn) else {
        state.error = format!("{fqdn} is not in the shard registry");
        return state;
    };

    let info = match node.get_info().await {
        Ok(info) => info,
        Err(err) => {
            state.error = err.to_string();
            match node.cached_info() {
                Some(cached) => cached,
                None => {
                    state.ping_ok = false;
                    state.ping_stable = false;
                    return state;
                }
            }
        }
    };
    (state.ping_ok, state.ping_stable) = node.evaluate_ping();

    macro_rules! required {
        ($expr:expr) => {
            match $expr {
                Ok(value) => value,
                Err(message) => {
                    state.error = message;
                    return state;
                }
            }
        };
    }

    state.run_id = required!(
        info.get("run_id")
            .cloned()
            .ok_or_else(|| "No run_id in info".to_string())
    );
    state.replication_id = required!(
        info.get("master_replid")
            .cloned()
            .ok_or_else(|| "No master_replid in info".to_string())
    );
    state.replication_id2 = required!(
        info.get("master_replid2")
            .cloned()
            .ok_or_else(|| "No master_replid2 in info".to_string())
    );
    state.master_replication_offset = required!(parse_i64(&info, "master_repl_offset"));
    state.second_replication_offset = required!(parse_i64(&info, "second_repl_offset"));
    state.replication_backlog_start = required!(parse_i64(&info, "repl_backlog_first_byte_offset"));
    state.replication_backlog_size = required!(parse_i64(&info, "repl_backlog_histlen"));

    let role = required!(
        info.get("role")
            .cloned()
            .ok_or_else(|| "No role in info".to_string())
    );
    if role == "master" {
        state.is_master = true;
        state.connected_replicas = parse_connected_replicas(&info);
    } else {
        state.is_master = false;
        let mut rs = ReplicaState {
            master_host: required!(
                info.get("master_host")
                    .cloned()
                    .ok_or_else(|| "Replica but no master_host in info".to_string())
            ),
            ..ReplicaState::default()
        };
        let link_state = required!(
            info.get("master_link_status")
                .cloned()
                .ok_or_else(|| "Replica but no master_link_status in info".to_string())
        );
        rs.master_link_state = link_state == "up";
        let sync_in_progress = required!(
            info.get("master_sync_in_progress")
                .cloned()
                .ok_or_else(|| "Replica but no master_sync_in_progress in info".to_string())
        );
        rs.master_sync_in_progress = sync_in_progress != "0";
        if !rs.master_link_state && !rs.master_sync_in_progress {
            rs.master_link_down_time =
                required!(parse_i64(&info, "master_link_down_since_seconds")) * 1000;
        }
        if rs.master_link_state {
            rs.master_last_io_seconds = parse_i64(&info, "master_last_io_seconds_ago").unwrap_or(0);
        }
        rs.replication_offset = required!(parse_i64(&info, "slave_repl_offset"));
        state.replica_state = Some(rs);
    }

    state.min_replicas_to_write = match node.get_min_replicas_to_write().await {
        Ok(value) => value,
        Err(err) => {
            state.error = err.to_string();
            return state;
        }
    };
    state.is_read_only = state.min_replicas_to_write == READ_ONLY_MIN_REPLICAS;
    state.is_offline = match node.is_offline().await {
        Ok(value) => value,
        Err(err) => {
            state.error = err.to_string();
            return state;
        }
    };
    state.is_repl_paused = match node.is_repl_paused().await {
        Ok(value) => value,
        Err(err) => {
            state.error = err.to_string();
            return state;
        }
    };
    if let Err(err) = node.refresh_addrs().await {
        state.error = err.to_string();
        return state;
    }
    state.ip = node.get_ip().unwrap_or_default();
    state.ips = node.get_ips();
    state
}

/// Reads a peer's health record; missing or unreadable records yield a
/// zero-value state with `ping_ok=false`.
async fn host_state_from_dcs(dcs: &Arc<dyn Dcs>, fqdn: &str) -> HostState {
    let path = dcs::join_path(&[PATH_HEALTH_PREFIX, fqdn]);
    dcs::get_json::<HostState>(dcs.as_ref(), &path)
        .await
        .unwrap_or_default()
}

impl Agent {
    pub(crate) async fn get_host_state(&self, fqdn: &str) -> HostState {
        host_state_from_db(&self.config, &self.shard, fqdn).await
    }

    /// State of the local engine, if the registry already knows it.
    pub(crate) async fn get_local_state(&self) -> Option<HostState> {
        let local = self.shard.local()?;
        Some(self.get_host_state(local.fqdn()).await)
    }

    /// Polls every host's engine in parallel. One task per host, joined over
    /// a channel bounded by the host count; a task failure fails the snapshot.
    pub(crate) async fn get_shard_state_from_db(&self) -> Result<ShardStateMap> {
        let hosts = self.shard.hosts();
        let (tx, mut rx) = mpsc::channel(hosts.len().max(1));
        for host in &hosts {
            let tx = tx.clone();
            let config = Arc::clone(&self.config);
            let shard = Arc::clone(&self.shard);
            let host = host.clone();
            tokio::spawn(async move {
                let state = host_state_from_db(&config, &shard, &host).await;
                let _ = tx.send((host, state)).await;
            });
        }
        drop(tx);
        let mut shard_state = ShardStateMap::with_capacity(hosts.len());
        while let Some((host, state)) = rx.recv().await {
            shard_state.insert(host, state);
        }
        if shard_state.len() != hosts.len() {
            return Err(anyhow!(
                "collected {} host states out of {}",
                shard_state.len(),
                hosts.len()
            ));
        }
        Ok(shard_state)
    }

    /// Reads every peer's health record in parallel; per-host failures are
    /// tolerated and yield zero-value states.
    pub(crate) async fn get_shard_state_from_dcs(&self) -> Result<ShardStateMap> {
        let hosts = self.shard.hosts();
        let (tx, mut rx) = mpsc::channel(hosts.len().max(1));
        for host in &hosts {
            let tx = tx.clone();
            let dcs = Arc::clone(&self.dcs);
            let host = host.clone();
            tokio::spawn(async move {
                let state = host_state_from_dcs(&dcs, &host).await;
                let _ = tx.send((host, state)).await;
            });
        }
        drop(tx);
        let mut shard_state = ShardStateMap::with_capacity(hosts.len());
        while let Some((host, state)) = rx.recv().await {
            shard_state.insert(host, state);
        }
        Ok(shard_state)
    }
}

/// Folds a per-host result map into a single error, if any host failed.
pub(crate) fn combine_errors(results: &HashMap<String, Result<()>>) -> Result<()> {
    let mut combined = String::new();
    for result in results.values() {
        if let Err(err) = result {
            combined.push_str(&err.to_string());
            combined.push(';');
        }
    }
    if combined.is_empty() {
        Ok(())
    } else {
        Err(anyhow!(combined))
    }
}
