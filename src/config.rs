// src/config.rs

//! Manages agent configuration: loading, defaults, and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

/// Shard coordination mode of the underlying data engine.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, strum_macros::Display)]
pub enum EngineMode {
    #[default]
    Sentinel,
    Cluster,
}

/// Desired append-only-file policy for the local engine.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, strum_macros::Display)]
pub enum AofMode {
    #[default]
    Unspecified,
    On,
    Off,
    OnReplicas,
}

/// Connection info and timeouts for the data engine instances.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EngineConfig {
    #[serde(default = "default_engine_port")]
    pub port: u16,
    #[serde(default = "default_cluster_bus_port")]
    pub cluster_bus_port: u16,
    #[serde(default)]
    pub auth_user: String,
    #[serde(default)]
    pub auth_password: String,
    #[serde(with = "humantime_serde", default = "default_dial_timeout")]
    pub dial_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_read_timeout")]
    pub read_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_write_timeout")]
    pub write_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_dns_ttl")]
    pub dns_ttl: Duration,
    #[serde(with = "humantime_serde", default = "default_failover_timeout")]
    pub failover_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_failover_cooldown")]
    pub failover_cooldown: Duration,
    #[serde(with = "humantime_serde", default = "default_restart_timeout")]
    pub restart_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_busy_timeout")]
    pub busy_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_wait_replication_timeout")]
    pub wait_replication_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_wait_catchup_timeout")]
    pub wait_catchup_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_wait_promote_timeout")]
    pub wait_promote_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_wait_promote_force_timeout")]
    pub wait_promote_force_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_wait_poison_pill_timeout")]
    pub wait_poison_pill_timeout: Duration,
    #[serde(default = "default_max_parallel_syncs")]
    pub max_parallel_syncs: usize,
    #[serde(default = "default_max_replicas_to_write")]
    pub max_replicas_to_write: usize,
    #[serde(default)]
    pub allow_data_loss: bool,
    #[serde(default)]
    pub turn_before_switchover: bool,
    #[serde(default = "default_restart_command")]
    pub restart_command: String,
    #[serde(default = "default_reserved_connections")]
    pub reserved_connections: u64,
    #[serde(with = "humantime_serde", default = "default_stale_replica_lag_open")]
    pub stale_replica_lag_open: Duration,
    #[serde(with = "humantime_serde", default = "default_stale_replica_lag_close")]
    pub stale_replica_lag_close: Duration,
    #[serde(default)]
    pub destructive_replication_repair_command: String,
    #[serde(
        with = "humantime_serde",
        default = "default_destructive_replication_repair_timeout"
    )]
    pub destructive_replication_repair_timeout: Duration,
    #[serde(default)]
    pub aof_mode: AofMode,
    #[serde(default)]
    pub aof_path: String,
}

fn default_engine_port() -> u16 {
    6379
}
fn default_cluster_bus_port() -> u16 {
    16379
}
fn default_dial_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_read_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_write_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_dns_ttl() -> Duration {
    Duration::from_secs(300)
}
fn default_failover_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_failover_cooldown() -> Duration {
    Duration::from_secs(30 * 60)
}
fn default_restart_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}
fn default_busy_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_wait_replication_timeout() -> Duration {
    Duration::from_secs(15 * 60)
}
fn default_wait_catchup_timeout() -> Duration {
    Duration::from_secs(10 * 60)
}
fn default_wait_promote_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}
fn default_wait_promote_force_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_wait_poison_pill_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_max_parallel_syncs() -> usize {
    1
}
fn default_max_replicas_to_write() -> usize {
    1
}
fn default_restart_command() -> String {
    "systemctl restart valkey-server".to_string()
}
fn default_reserved_connections() -> u64 {
    16
}
fn default_stale_replica_lag_open() -> Duration {
    Duration::from_secs(5 * 60)
}
fn default_stale_replica_lag_close() -> Duration {
    Duration::from_secs(15 * 60)
}
fn default_destructive_replication_repair_timeout() -> Duration {
    Duration::from_secs(10 * 60)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            port: default_engine_port(),
            cluster_bus_port: default_cluster_bus_port(),
            auth_user: String::new(),
            auth_password: String::new(),
            dial_timeout: default_dial_timeout(),
            read_timeout: default_read_timeout(),
            write_timeout: default_write_timeout(),
            dns_ttl: default_dns_ttl(),
            failover_timeout: default_failover_timeout(),
            failover_cooldown: default_failover_cooldown(),
            restart_timeout: default_restart_timeout(),
            busy_timeout: default_busy_timeout(),
            wait_replication_timeout: default_wait_replication_timeout(),
            wait_catchup_timeout: default_wait_catchup_timeout(),
            wait_promote_timeout: default_wait_promote_timeout(),
            wait_promote_force_timeout: default_wait_promote_force_timeout(),
            wait_poison_pill_timeout: default_wait_poison_pill_timeout(),
            max_parallel_syncs: default_max_parallel_syncs(),
            max_replicas_to_write: default_max_replicas_to_write(),
            allow_data_loss: false,
            turn_before_switchover: false,
            restart_command: default_restart_command(),
            reserved_connections: default_reserved_connections(),
            stale_replica_lag_open: default_stale_replica_lag_open(),
            stale_replica_lag_close: default_stale_replica_lag_close(),
            destructive_replication_repair_command: String::new(),
            destructive_replication_repair_timeout:
                default_destructive_replication_repair_timeout(),
            aof_mode: AofMode::default(),
            aof_path: String::new(),
        }
    }
}

/// Connection info for the distributed coordination store.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DcsConfig {
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default = "default_dcs_namespace")]
    pub namespace: String,
    #[serde(with = "humantime_serde", default = "default_session_timeout")]
    pub session_timeout: Duration,
}

fn default_dcs_namespace() -> String {
    "/shardkeeper".to_string()
}
fn default_session_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for DcsConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            namespace: default_dcs_namespace(),
            session_timeout: default_session_timeout(),
        }
    }
}

/// The resolved agent configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default)]
    pub mode: EngineMode,
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_info_file")]
    pub info_file: String,
    #[serde(default = "default_daemon_lock_file")]
    pub daemon_lock_file: String,
    #[serde(default = "default_maintenance_file")]
    pub maintenance_file: String,
    #[serde(with = "humantime_serde", default = "default_tick_interval")]
    pub tick_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_health_check_interval")]
    pub health_check_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_info_file_handler_interval")]
    pub info_file_handler_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_inactivation_delay")]
    pub inactivation_delay: Duration,
    #[serde(with = "humantime_serde", default = "default_dcs_wait_timeout")]
    pub dcs_wait_timeout: Duration,
    #[serde(default = "default_ping_stable")]
    pub ping_stable: usize,
    #[serde(default)]
    pub event_timing_notify_command: String,
    #[serde(default)]
    pub event_timing_notify_args: Vec<String>,
    #[serde(default)]
    pub dcs: DcsConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_hostname() -> String {
    hostname_from_os().unwrap_or_else(|| "localhost".to_string())
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_info_file() -> String {
    "/var/run/shardkeeper/shardkeeper.info".to_string()
}
fn default_daemon_lock_file() -> String {
    "/var/run/shardkeeper/shardkeeper.lock".to_string()
}
fn default_maintenance_file() -> String {
    "/var/run/shardkeeper/shardkeeper.maintenance".to_string()
}
fn default_tick_interval() -> Duration {
    Duration::from_secs(5)
}
fn default_health_check_interval() -> Duration {
    Duration::from_secs(5)
}
fn default_info_file_handler_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_inactivation_delay() -> Duration {
    Duration::from_secs(30)
}
fn default_dcs_wait_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_ping_stable() -> usize {
    3
}

fn hostname_from_os() -> Option<String> {
    let mut buf = [0u8; 256];
    // SAFETY: buf is a valid, writable buffer of the length we pass.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return None;
    }
    let end = buf.iter().position(|&b| b == 0)?;
    String::from_utf8(buf[..end].to_vec()).ok()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: EngineMode::default(),
            hostname: default_hostname(),
            log_level: default_log_level(),
            info_file: default_info_file(),
            daemon_lock_file: default_daemon_lock_file(),
            maintenance_file: default_maintenance_file(),
            tick_interval: default_tick_interval(),
            health_check_interval: default_health_check_interval(),
            info_file_handler_interval: default_info_file_handler_interval(),
            inactivation_delay: default_inactivation_delay(),
            dcs_wait_timeout: default_dcs_wait_timeout(),
            ping_stable: default_ping_stable(),
            event_timing_notify_command: String::new(),
            event_timing_notify_args: Vec::new(),
            dcs: DcsConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration to ensure logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.hostname.trim().is_empty() {
            return Err(anyhow!("hostname cannot be empty"));
        }
        if self.engine.port == 0 {
            return Err(anyhow!("engine.port cannot be 0"));
        }
        if self.ping_stable == 0 {
            return Err(anyhow!("ping_stable cannot be 0"));
        }
        if self.tick_interval.is_zero() {
            return Err(anyhow!("tick_interval cannot be 0"));
        }
        if self.engine.max_parallel_syncs == 0 {
            return Err(anyhow!("engine.max_parallel_syncs cannot be 0"));
        }
        if self.engine.stale_replica_lag_close < self.engine.stale_replica_lag_open {
            return Err(anyhow!(
                "engine.stale_replica_lag_close must not be below engine.stale_replica_lag_open"
            ));
        }
        if self.mode == EngineMode::Cluster && self.engine.cluster_bus_port == 0 {
            return Err(anyhow!(
                "engine.cluster_bus_port cannot be 0 in cluster mode"
            ));
        }
        Ok(())
    }
}
