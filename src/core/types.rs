// src/core/types.rs

//! Shared data structures persisted in the DCS and exchanged between agents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// The manager lock node. Held by exactly one agent per shard.
pub const PATH_MANAGER_LOCK: &str = "manager";

pub const PATH_MASTER_NODE: &str = "master";

/// Active nodes are master + alive running HA replicas.
/// Structure: list of hosts (strings).
pub const PATH_ACTIVE_NODES: &str = "active_nodes";

/// Structure: PATH_HEALTH_PREFIX/hostname -> HostState
pub const PATH_HEALTH_PREFIX: &str = "health";

/// Structure: single Switchover
pub const PATH_CURRENT_SWITCH: &str = "current_switch";

/// Structure: single Switchover
pub const PATH_LAST_SWITCH: &str = "last_switch";

/// Structure: single Switchover
pub const PATH_LAST_REJECTED_SWITCH: &str = "last_rejected_switch";

/// Structure: single Maintenance
pub const PATH_MAINTENANCE: &str = "maintenance";

/// List of HA nodes. May be modified by external tools (e.g. remove node from HA-cluster).
/// Structure: PATH_HA_NODES/hostname -> NodeConfiguration
pub const PATH_HA_NODES: &str = "ha_nodes";

/// Fence flag.
/// Structure: single PoisonPill
pub const PATH_POISON_PILL: &str = "poison_pill";

/// The engine has no native read-only toggle; the agent encodes read-only by
/// setting min-replicas-to-write to this unreachable value.
pub const READ_ONLY_MIN_REPLICAS: i64 = 65535;

/// Per-host shard view keyed by fqdn.
pub type ShardStateMap = HashMap<String, HostState>;

/// Status check of a single host performed by some shardkeeper process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostState {
    #[serde(default)]
    pub check_by: String,
    #[serde(default)]
    pub check_at: DateTime<Utc>,
    #[serde(default)]
    pub ping_ok: bool,
    #[serde(default)]
    pub ping_stable: bool,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub ips: Vec<String>,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub is_master: bool,
    #[serde(default)]
    pub is_offline: bool,
    #[serde(default)]
    pub is_read_only: bool,
    #[serde(default)]
    pub is_repl_paused: bool,
    #[serde(default)]
    pub master_replication_offset: i64,
    #[serde(default)]
    pub second_replication_offset: i64,
    #[serde(default)]
    pub replication_backlog_start: i64,
    #[serde(default)]
    pub replication_backlog_size: i64,
    #[serde(default)]
    pub replication_id: String,
    #[serde(default)]
    pub replication_id2: String,
    #[serde(default)]
    pub min_replicas_to_write: i64,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub connected_replicas: Vec<String>,
    #[serde(default)]
    pub replica_state: Option<ReplicaState>,
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ping = if self.ping_ok { "ok" } else { "err" };
        let (repl, offset) = if self.is_master {
            ("master", self.master_replication_offset)
        } else if let Some(rs) = &self.replica_state {
            (
                if rs.master_link_state { "ok" } else { "err" },
                rs.replication_offset,
            )
        } else {
            ("???", 0)
        };
        write!(f, "<ping={ping} repl={repl} offset={offset}>")
    }
}

/// Replica specific info. A master always has this state empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicaState {
    #[serde(default)]
    pub master_host: String,
    #[serde(default)]
    pub master_link_state: bool,
    #[serde(default)]
    pub master_link_down_time: i64,
    #[serde(default)]
    pub master_sync_in_progress: bool,
    #[serde(default)]
    pub replication_offset: i64,
    #[serde(default)]
    pub master_last_io_seconds: i64,
}

impl fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<{} {}: {}>",
            self.master_host, self.master_link_state, self.replication_offset
        )
    }
}

/// What started a switchover.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchoverCause {
    /// Issued via command line.
    #[default]
    Manual,
    /// Initiated via DCS by an external worker.
    Worker,
    /// Started automatically by the failure detection process.
    Auto,
}

impl fmt::Display for SwitchoverCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwitchoverCause::Manual => write!(f, "manual"),
            SwitchoverCause::Worker => write!(f, "worker"),
            SwitchoverCause::Auto => write!(f, "auto"),
        }
    }
}

/// Info about a currently running or scheduled switchover/failover process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Switchover {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub cause: SwitchoverCause,
    #[serde(default)]
    pub initiated_by: String,
    #[serde(default)]
    pub initiated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_by: String,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<SwitchoverResult>,
    #[serde(default)]
    pub progress: Option<SwitchoverProgress>,
    #[serde(default)]
    pub run_count: u32,
}

impl fmt::Display for Switchover {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.result {
            Some(result) if result.ok => "done",
            Some(_) => "error",
            None if self.started_at.is_some() => "running",
            None => "scheduled",
        };
        let from = if self.from.is_empty() { "*" } else { &self.from };
        let to = if self.to.is_empty() { "*" } else { &self.to };
        write!(
            f,
            "<{state} {from}=>{to} {} by {} at {}>",
            self.cause, self.initiated_by, self.initiated_at
        )
    }
}

/// Result of a finished/failed switchover.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SwitchoverResult {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub finished_at: DateTime<Utc>,
}

/// Intents and status of a running switchover.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SwitchoverProgress {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub phase: u32,
    #[serde(default)]
    pub new_master: String,
    #[serde(default)]
    pub most_recent: String,
}

/// Presence of this record means the shard is under manual control.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Maintenance {
    #[serde(default)]
    pub initiated_by: String,
    #[serde(default)]
    pub initiated_at: DateTime<Utc>,
    #[serde(default)]
    pub shardkeeper_paused: bool,
    #[serde(default)]
    pub should_leave: bool,
}

impl fmt::Display for Maintenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.should_leave {
            "leaving"
        } else if self.shardkeeper_paused {
            "on"
        } else {
            "entering"
        };
        write!(f, "<{state} by {} at {}>", self.initiated_by, self.initiated_at)
    }
}

/// Fencing record instructing one host to self-offline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoisonPill {
    #[serde(default)]
    pub applied: bool,
    #[serde(default)]
    pub initiated_at: DateTime<Utc>,
    #[serde(default)]
    pub initiated_by: String,
    #[serde(default)]
    pub target_host: String,
}

impl fmt::Display for PoisonPill {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.applied { "on" } else { "entering" };
        write!(
            f,
            "<{state} by {} for {} at {}>",
            self.initiated_by, self.target_host, self.initiated_at
        )
    }
}
