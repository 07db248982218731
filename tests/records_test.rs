// tests/records_test.rs

//! Serialization behavior of the records persisted in the coordination store.

use shardkeeper::core::types::{
    HostState, Maintenance, PoisonPill, Switchover, SwitchoverCause,
};

#[test]
fn switchover_deserializes_from_sparse_payloads() {
    // a freshly scheduled failover record carries almost nothing
    let raw = r#"{"from":"db1","cause":"auto","initiated_by":"db2"}"#;
    let switchover: Switchover = serde_json::from_str(raw).unwrap();
    assert_eq!(switchover.from, "db1");
    assert_eq!(switchover.cause, SwitchoverCause::Auto);
    assert!(switchover.result.is_none());
    assert!(switchover.progress.is_none());
    assert_eq!(switchover.run_count, 0);
    assert_eq!(switchover.to_string().split(' ').next(), Some("<scheduled"));
}

#[test]
fn switchover_display_reflects_lifecycle() {
    let mut switchover: Switchover =
        serde_json::from_str(r#"{"from":"db1","cause":"manual"}"#).unwrap();
    assert!(switchover.to_string().starts_with("<scheduled db1=>*"));
    switchover.started_at = Some(chrono::Utc::now());
    assert!(switchover.to_string().starts_with("<running"));
    switchover.result = Some(shardkeeper::core::types::SwitchoverResult {
        ok: true,
        ..Default::default()
    });
    assert!(switchover.to_string().starts_with("<done"));
}

#[test]
fn poison_pill_roundtrips_applied_flag() {
    let pill = PoisonPill {
        target_host: "db1".to_string(),
        initiated_by: "db2".to_string(),
        applied: false,
        ..PoisonPill::default()
    };
    let raw = serde_json::to_string(&pill).unwrap();
    let mut read: PoisonPill = serde_json::from_str(&raw).unwrap();
    assert_eq!(read.target_host, "db1");
    assert!(!read.applied);
    read.applied = true;
    assert!(read.to_string().starts_with("<on"));
}

#[test]
fn maintenance_display_tracks_state() {
    let mut maintenance: Maintenance = serde_json::from_str("{}").unwrap();
    assert!(maintenance.to_string().starts_with("<entering"));
    maintenance.shardkeeper_paused = true;
    assert!(maintenance.to_string().starts_with("<on"));
    maintenance.should_leave = true;
    assert!(maintenance.to_string().starts_with("<leaving"));
}

#[test]
fn host_state_tolerates_missing_fields() {
    let state: HostState = serde_json::from_str(r#"{"ping_ok":true}"#).unwrap();
    assert!(state.ping_ok);
    assert!(!state.is_master);
    assert!(state.replica_state.is_none());
    assert_eq!(state.to_string(), "<ping=ok repl=??? offset=0>");
}
