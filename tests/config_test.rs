// tests/config_test.rs

//! Configuration loading, defaults and validation.

use shardkeeper::config::{AofMode, Config, EngineMode};
use std::io::Write;
use std::time::Duration;

#[test]
fn minimal_config_gets_defaults() {
    let config: Config = toml::from_str("hostname = \"db1.example.net\"").unwrap();
    assert_eq!(config.hostname, "db1.example.net");
    assert_eq!(config.mode, EngineMode::Sentinel);
    assert_eq!(config.tick_interval, Duration::from_secs(5));
    assert_eq!(config.ping_stable, 3);
    assert_eq!(config.engine.port, 6379);
    assert_eq!(config.engine.failover_timeout, Duration::from_secs(30));
    assert_eq!(config.engine.aof_mode, AofMode::Unspecified);
    assert!(!config.engine.allow_data_loss);
    config.validate().unwrap();
}

#[test]
fn full_config_parses_durations_and_mode() {
    let raw = r#"
mode = "Cluster"
hostname = "db1.example.net"
tick_interval = "2s"
inactivation_delay = "1m"

[engine]
port = 6380
cluster_bus_port = 16380
failover_timeout = "45s"
failover_cooldown = "1h"
wait_promote_timeout = "3m"
allow_data_loss = true
aof_mode = "OnReplicas"
stale_replica_lag_open = "2m"
stale_replica_lag_close = "10m"

[dcs]
hosts = ["zk1:2181", "zk2:2181"]
namespace = "/shards/alpha"
"#;
    let config: Config = toml::from_str(raw).unwrap();
    assert_eq!(config.mode, EngineMode::Cluster);
    assert_eq!(config.tick_interval, Duration::from_secs(2));
    assert_eq!(config.inactivation_delay, Duration::from_secs(60));
    assert_eq!(config.engine.port, 6380);
    assert_eq!(config.engine.failover_cooldown, Duration::from_secs(3600));
    assert!(config.engine.allow_data_loss);
    assert_eq!(config.engine.aof_mode, AofMode::OnReplicas);
    assert_eq!(config.dcs.hosts.len(), 2);
    assert_eq!(config.dcs.namespace, "/shards/alpha");
    config.validate().unwrap();
}

#[test]
fn validation_rejects_inconsistent_settings() {
    let mut config: Config = toml::from_str("hostname = \"db1\"").unwrap();
    config.ping_stable = 0;
    assert!(config.validate().is_err());

    let mut config: Config = toml::from_str("hostname = \"db1\"").unwrap();
    config.engine.stale_replica_lag_close = Duration::from_secs(10);
    config.engine.stale_replica_lag_open = Duration::from_secs(60);
    assert!(config.validate().is_err());

    let mut config: Config = toml::from_str("hostname = \"db1\"").unwrap();
    config.mode = EngineMode::Cluster;
    config.engine.cluster_bus_port = 0;
    assert!(config.validate().is_err());

    let mut config: Config = toml::from_str("hostname = \"db1\"").unwrap();
    config.hostname = "  ".to_string();
    assert!(config.validate().is_err());
}

#[test]
fn from_file_reads_and_validates() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "hostname = \"db1.example.net\"").unwrap();
    writeln!(file, "[engine]").unwrap();
    writeln!(file, "port = 7000").unwrap();
    let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
    assert_eq!(config.engine.port, 7000);
}

#[test]
fn from_file_reports_missing_files() {
    assert!(Config::from_file("/nonexistent/shardkeeper.toml").is_err());
}
