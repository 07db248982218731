// src/core/engine/node.rs

//! API to query and manipulate a single data-engine instance.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

use super::client::{ClientTimeouts, EngineClient};
use super::resp::RespValue;
use super::{EngineError, Rewrite};
use crate::config::Config;
use crate::core::types::READ_ONLY_MIN_REPLICAS;

const LOCALHOST: &str = "127.0.0.1";

/// Combined local-node snapshot fetched in a single adapter call.
pub struct LocalState {
    pub info: HashMap<String, String>,
    pub min_replicas_to_write: i64,
    pub is_offline: bool,
    pub is_repl_paused: bool,
}

struct AddrCache {
    ips: Vec<IpAddr>,
    refreshed_at: Option<Instant>,
}

struct InfoWindow {
    results: VecDeque<bool>,
    cached: Option<HashMap<String, String>>,
}

/// One data-engine instance, addressed by fqdn.
///
/// The local instance is always dialed over loopback: offline mode forbids
/// connections on non-lo interfaces.
pub struct Node {
    config: Arc<Config>,
    fqdn: String,
    dial_addr: String,
    addrs: Mutex<AddrCache>,
    cluster_id: Mutex<Option<String>>,
    window: Mutex<InfoWindow>,
    conn: tokio::sync::Mutex<Option<EngineClient>>,
}

async fn uniq_lookup(fqdn: &str, port: u16) -> Result<Vec<IpAddr>, EngineError> {
    let addrs = tokio::net::lookup_host((fqdn, port))
        .await
        .map_err(|_| EngineError::Dns(fqdn.to_string()))?;
    let mut seen = Vec::new();
    for addr in addrs {
        if !seen.contains(&addr.ip()) {
            seen.push(addr.ip());
        }
    }
    Ok(seen)
}

impl Node {
    pub async fn new(config: Arc<Config>, fqdn: &str) -> Arc<Node> {
        let host = if fqdn == config.hostname {
            LOCALHOST
        } else {
            fqdn
        };
        let dial_addr = format!("{host}:{}", config.engine.port);
        let (ips, refreshed_at) = match uniq_lookup(fqdn, config.engine.port).await {
            Ok(ips) => (ips, Some(Instant::now())),
            Err(err) => {
                warn!("Dns lookup failed for {fqdn}: {err}");
                (Vec::new(), None)
            }
        };
        Arc::new(Node {
            config,
            fqdn: fqdn.to_string(),
            dial_addr,
            addrs: Mutex::new(AddrCache {
                ips,
                refreshed_at,
            }),
            cluster_id: Mutex::new(None),
            window: Mutex::new(InfoWindow {
                results: VecDeque::new(),
                cached: None,
            }),
            conn: tokio::sync::Mutex::new(None),
        })
    }

    pub fn fqdn(&self) -> &str {
        &self.fqdn
    }

    /// True if this instance runs on the same host as the calling agent.
    pub fn is_local(&self) -> bool {
        self.fqdn == self.config.hostname
    }

    /// Checks if the node answers to the given hostname or ip.
    pub fn match_host(&self, host: &str) -> bool {
        if self.fqdn == host {
            return true;
        }
        let Ok(host_ip) = host.parse::<IpAddr>() else {
            return false;
        };
        self.addrs.lock().ips.contains(&host_ip)
    }

    /// All identities this node answers to: fqdn plus resolved addresses.
    pub fn identities(&self) -> Vec<String> {
        let mut ids = vec![self.fqdn.clone()];
        ids.extend(self.get_ips());
        ids
    }

    /// Updates the internal address list once the DNS TTL has passed.
    pub async fn refresh_addrs(&self) -> Result<(), EngineError> {
        {
            let cache = self.addrs.lock();
            if let Some(at) = cache.refreshed_at {
                if at.elapsed() < self.config.engine.dns_ttl {
                    debug!("Not updating ips cache due to ttl");
                    return Ok(());
                }
            }
        }
        debug!("Updating ips cache for {}", self.fqdn);
        let ips = uniq_lookup(&self.fqdn, self.config.engine.port).await?;
        let mut cache = self.addrs.lock();
        cache.ips = ips;
        cache.refreshed_at = Some(Instant::now());
        Ok(())
    }

    /// First resolved ip as string.
    pub fn get_ip(&self) -> Result<String, EngineError> {
        self.addrs
            .lock()
            .ips
            .first()
            .map(|ip| ip.to_string())
            .ok_or_else(|| EngineError::Dns(self.fqdn.clone()))
    }

    pub fn get_ips(&self) -> Vec<String> {
        self.addrs.lock().ips.iter().map(|ip| ip.to_string()).collect()
    }

    async fn command(&self, args: &[&str]) -> Result<RespValue, EngineError> {
        let timeouts = ClientTimeouts {
            dial: self.config.engine.dial_timeout,
            read: self.config.engine.read_timeout,
            write: self.config.engine.write_timeout,
        };
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(
                EngineClient::connect(
                    &self.dial_addr,
                    timeouts,
                    &self.config.engine.auth_user,
                    &self.config.engine.auth_password,
                )
                .await?,
            );
        }
        let client = guard.as_mut().expect("connection was just established");
        match client.command(args).await {
            Ok(value) => Ok(value),
            Err(err @ EngineError::Server(_)) => Err(err),
            Err(err) => {
                // drop the broken connection so the next call redials
                *guard = None;
                Err(err)
            }
        }
    }

    async fn config_get(&self, param: &str) -> Result<String, EngineError> {
        let reply = self.command(&["CONFIG", "GET", param]).await?;
        let RespValue::Array(Some(items)) = &reply else {
            return Err(EngineError::UnexpectedReply(format!(
                "config get {param}: {reply:?}"
            )));
        };
        if items.len() != 2 {
            return Err(EngineError::UnexpectedReply(format!(
                "config get {param}: {reply:?}"
            )));
        }
        items[1]
            .as_text()
            .ok_or_else(|| EngineError::UnexpectedReply(format!("config get {param}: {reply:?}")))
    }

    async fn config_set(&self, param: &str, value: &str) -> Result<(), EngineError> {
        let reply = self.command(&["CONFIG", "SET", param, value]).await?;
        match reply {
            RespValue::Simple(s) if s == "OK" => Ok(()),
            other => Err(EngineError::UnexpectedReply(format!(
                "config set {param}: {other:?}"
            ))),
        }
    }

    async fn config_rewrite(&self) -> Rewrite {
        let reply = self.command(&["CONFIG", "REWRITE"]).await?;
        match reply {
            RespValue::Simple(s) if s == "OK" => Ok(()),
            other => Err(EngineError::UnexpectedReply(format!(
                "config rewrite: {other:?}"
            ))),
        }
    }

    /// Whole info snapshot; doubles as the ping used by the health window.
    pub async fn get_info(&self) -> Result<HashMap<String, String>, EngineError> {
        let reply = self.command(&["INFO"]).await;
        let window_size = self.config.ping_stable;
        match reply {
            Err(err) => {
                let mut window = self.window.lock();
                window.results.push_back(false);
                while window.results.len() > window_size {
                    window.results.pop_front();
                }
                if !window.results.iter().any(|ok| *ok) {
                    window.cached = None;
                }
                Err(err)
            }
            Ok(value) => {
                let text = value.as_text().ok_or_else(|| {
                    EngineError::UnexpectedReply(format!("info: {value:?}"))
                })?;
                let mut res = HashMap::new();
                for line in text.split("\r\n") {
                    if let Some((key, val)) = line.split_once(':') {
                        res.insert(key.to_string(), val.to_string());
                    }
                }
                let mut window = self.window.lock();
                window.results.push_back(true);
                while window.results.len() > window_size {
                    window.results.pop_front();
                }
                window.cached = Some(res.clone());
                Ok(res)
            }
        }
    }

    /// Last successfully fetched info snapshot, if any ping in the window succeeded.
    pub fn cached_info(&self) -> Option<HashMap<String, String>> {
        self.window.lock().cached.clone()
    }

    /// Sliding-window ping evaluation: (any success, all successes).
    pub fn evaluate_ping(&self) -> (bool, bool) {
        let window = self.window.lock();
        let mut ok = false;
        let mut stable = true;
        for result in &window.results {
            if *result {
                ok = true;
            } else {
                stable = false;
            }
        }
        (ok, stable)
    }

    /// Offline status of the node.
    pub async fn is_offline(&self) -> Result<bool, EngineError> {
        Ok(self.config_get("offline").await? == "yes")
    }

    /// Pause status of replication on the node.
    pub async fn is_repl_paused(&self) -> Result<bool, EngineError> {
        Ok(self.config_get("repl-paused").await? == "yes")
    }

    pub async fn get_min_replicas_to_write(&self) -> Result<i64, EngineError> {
        let value = self.config_get("min-replicas-to-write").await?;
        value.parse().map_err(|_| {
            EngineError::UnexpectedReply(format!("min-replicas-to-write value: {value}"))
        })
    }

    pub async fn get_num_quorum_replicas(&self) -> Result<i64, EngineError> {
        let value = self.config_get("quorum-replicas-to-write").await?;
        value.parse().map_err(|_| {
            EngineError::UnexpectedReply(format!("quorum-replicas-to-write value: {value}"))
        })
    }

    /// Normalized (sorted) quorum replica set.
    pub async fn get_quorum_replicas(&self) -> Result<String, EngineError> {
        let value = self.config_get("quorum-replicas").await?;
        let mut split: Vec<&str> = value.split_whitespace().collect();
        split.sort_unstable();
        Ok(split.join(" "))
    }

    pub async fn get_appendonly(&self) -> Result<bool, EngineError> {
        Ok(self.config_get("appendonly").await? == "yes")
    }

    /// Info plus the local knobs repair needs, in one adapter call.
    pub async fn get_state(&self) -> Result<LocalState, EngineError> {
        let info = self.get_info().await?;
        let min_replicas_to_write = self.get_min_replicas_to_write().await?;
        let is_offline = self.is_offline().await?;
        let is_repl_paused = self.is_repl_paused().await?;
        Ok(LocalState {
            info,
            min_replicas_to_write,
            is_offline,
            is_repl_paused,
        })
    }

    /// Disallows non-localhost connections and drops existing clients.
    pub async fn set_offline(&self) -> Result<(), EngineError> {
        if !self.is_local() {
            return Err(EngineError::NotLocal(self.fqdn.clone()));
        }
        self.config_set("offline", "yes").await?;
        self.disconnect_clients("normal").await?;
        self.disconnect_clients("pubsub").await?;
        Ok(())
    }

    /// Allows non-localhost connections again.
    pub async fn set_online(&self) -> Result<(), EngineError> {
        if !self.is_local() {
            return Err(EngineError::NotLocal(self.fqdn.clone()));
        }
        self.config_set("offline", "no").await
    }

    /// Disconnects all connected clients of the specified type.
    pub async fn disconnect_clients(&self, client_type: &str) -> Result<(), EngineError> {
        self.command(&["CLIENT", "KILL", "TYPE", client_type])
            .await
            .map(|_| ())
    }

    /// Terminates a long-running script.
    pub async fn script_kill(&self) -> Result<(), EngineError> {
        self.command(&["SCRIPT", "KILL"]).await.map(|_| ())
    }

    /// Restarts the engine via the configured command. Local node only.
    pub async fn restart(&self) -> Result<(), EngineError> {
        if !self.is_local() {
            return Err(EngineError::NotLocal(self.fqdn.clone()));
        }
        let command = &self.config.engine.restart_command;
        warn!("Restarting with {command}");
        let mut parts = command.split_whitespace();
        let Some(program) = parts.next() else {
            return Err(EngineError::UnexpectedReply("empty restart command".to_string()));
        };
        let status = tokio::process::Command::new(program)
            .args(parts)
            .status()
            .await?;
        if !status.success() {
            return Err(EngineError::Protocol(format!(
                "restart command exited with {status}"
            )));
        }
        Ok(())
    }

    /// Makes the node read-only by setting min-replicas-to-write to an
    /// unreachable value, optionally disconnecting normal/pubsub clients.
    pub async fn set_read_only(&self, disconnect: bool) -> Result<Rewrite, EngineError> {
        self.config_set("min-replicas-to-write", &READ_ONLY_MIN_REPLICAS.to_string())
            .await?;
        let rewrite = self.config_rewrite().await;
        if disconnect {
            self.disconnect_clients("normal").await?;
            self.disconnect_clients("pubsub").await?;
        }
        Ok(rewrite)
    }

    /// Returns min-replicas-to-write to zero.
    pub async fn set_read_write(&self) -> Result<Rewrite, EngineError> {
        self.config_set("min-replicas-to-write", "0").await?;
        Ok(self.config_rewrite().await)
    }

    pub async fn pause_replication(&self) -> Result<Rewrite, EngineError> {
        self.config_set("repl-paused", "yes").await?;
        Ok(self.config_rewrite().await)
    }

    pub async fn resume_replication(&self) -> Result<Rewrite, EngineError> {
        self.config_set("repl-paused", "no").await?;
        Ok(self.config_rewrite().await)
    }

    /// Sets the number of connected quorum replicas required to accept writes.
    pub async fn set_num_quorum_replicas(&self, value: usize) -> Result<Rewrite, EngineError> {
        self.config_set("quorum-replicas-to-write", &value.to_string())
            .await?;
        Ok(self.config_rewrite().await)
    }

    /// Sets the quorum replica address list.
    pub async fn set_quorum_replicas(&self, value: &str) -> Result<Rewrite, EngineError> {
        self.config_set("quorum-replicas", value).await?;
        Ok(self.config_rewrite().await)
    }

    /// Clears quorum replicas, as it should be on replicas.
    pub async fn empty_quorum_replicas(&self) -> Result<(), EngineError> {
        let current = self.get_quorum_replicas().await?;
        if !current.is_empty() {
            let rewrite = self.set_quorum_replicas("").await?;
            if let Err(err) = rewrite {
                error!("Rewrite config failed on {}: {err}", self.fqdn);
            }
        }
        Ok(())
    }

    pub async fn set_appendonly(&self, value: bool) -> Result<Rewrite, EngineError> {
        let str_value = if value { "yes" } else { "no" };
        self.config_set("appendonly", str_value).await?;
        Ok(self.config_rewrite().await)
    }

    /// Makes the node a replica of the target in sentinel mode.
    pub async fn sentinel_make_replica(&self, target: &str) -> Result<(), EngineError> {
        if self.fqdn == target {
            return Err(EngineError::UnexpectedReply(format!(
                "making {} replica of itself is not possible",
                self.fqdn
            )));
        }
        self.empty_quorum_replicas().await?;
        let port = self.config.engine.port.to_string();
        self.command(&["REPLICAOF", target, &port]).await?;
        self.config_rewrite().await
    }

    /// Makes the node primary in sentinel mode.
    pub async fn sentinel_promote(&self) -> Result<(), EngineError> {
        self.command(&["REPLICAOF", "NO", "ONE"]).await?;
        self.config_rewrite().await
    }

    /// Cluster node id, cached after the first fetch.
    pub async fn cluster_get_id(&self) -> Result<String, EngineError> {
        if let Some(id) = self.cluster_id.lock().clone() {
            return Ok(id);
        }
        let reply = self.command(&["CLUSTER", "MYID"]).await?;
        let id = reply
            .as_text()
            .ok_or_else(|| EngineError::UnexpectedReply(format!("cluster myid: {reply:?}")))?;
        *self.cluster_id.lock() = Some(id.clone());
        Ok(id)
    }

    /// Makes the node replica of the target in cluster mode.
    pub async fn cluster_make_replica(&self, target_id: &str) -> Result<(), EngineError> {
        self.empty_quorum_replicas().await?;
        self.command(&["CLUSTER", "REPLICATE", target_id])
            .await
            .map(|_| ())
    }

    /// Checks if a majority of masters in the cluster are not failed.
    /// Unparsable lines are not counted on either side.
    pub async fn is_cluster_majority_alive(&self) -> Result<bool, EngineError> {
        let nodes = self.cluster_nodes().await?;
        let mut total_masters = 0usize;
        let mut failed_masters = 0usize;
        for line in nodes.lines() {
            let fields: Vec<&str> = line.split(' ').collect();
            if fields.len() < 3 {
                continue;
            }
            if fields[2].contains("master") {
                total_masters += 1;
                if fields[2].contains("fail") {
                    failed_masters += 1;
                }
            }
        }
        let res = failed_masters < total_masters / 2 + 1;
        debug!("Cluster majority alive check: {total_masters} total, {failed_masters} failed -> {res}");
        Ok(res)
    }

    pub async fn cluster_promote_force(&self) -> Result<(), EngineError> {
        self.command(&["CLUSTER", "FAILOVER", "FORCE"]).await.map(|_| ())
    }

    pub async fn cluster_promote_takeover(&self) -> Result<(), EngineError> {
        self.command(&["CLUSTER", "FAILOVER", "TAKEOVER"])
            .await
            .map(|_| ())
    }

    /// Checks if the node sees only itself in the cluster.
    pub async fn is_cluster_node_alone(&self) -> Result<bool, EngineError> {
        let nodes = self.cluster_nodes().await?;
        let count = nodes.lines().filter(|line| !line.trim().is_empty()).count();
        Ok(count == 1)
    }

    /// Makes the node join the cluster.
    pub async fn cluster_meet(
        &self,
        addr: &str,
        port: u16,
        cluster_bus_port: u16,
    ) -> Result<(), EngineError> {
        let port = port.to_string();
        let bus_port = cluster_bus_port.to_string();
        self.command(&["CLUSTER", "MEET", addr, &port, &bus_port])
            .await
            .map(|_| ())
    }

    /// Checks if the node has any slot assigned.
    pub async fn has_cluster_slots(&self) -> Result<bool, EngineError> {
        let nodes = self.cluster_nodes().await?;
        for line in nodes.lines() {
            let fields: Vec<&str> = line.split(' ').collect();
            if fields.len() < 3 {
                continue;
            }
            if fields[2].contains("myself") {
                return Ok(fields.len() > 8);
            }
        }
        Ok(false)
    }

    async fn cluster_nodes(&self) -> Result<String, EngineError> {
        let reply = self.command(&["CLUSTER", "NODES"]).await?;
        reply
            .as_text()
            .ok_or_else(|| EngineError::UnexpectedReply(format!("cluster nodes: {reply:?}")))
    }
}
