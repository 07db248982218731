// tests/dcs_memory_test.rs

//! Tests for the in-memory coordination store: session semantics, ephemeral
//! cleanup, lock exclusivity and tree reads.

use shardkeeper::core::dcs::memory::InMemoryDcs;
use shardkeeper::core::dcs::{self, Dcs, DcsError, LockOwner};
use shardkeeper::core::types::Maintenance;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[tokio::test]
async fn create_is_atomic() {
    let dcs = InMemoryDcs::new("/shardkeeper", "host1");
    dcs.create("maintenance", b"{}".to_vec()).await.unwrap();
    let err = dcs.create("maintenance", b"{}".to_vec()).await.unwrap_err();
    assert!(matches!(err, DcsError::Exists));
}

#[tokio::test]
async fn get_and_delete_missing_paths_report_not_found() {
    let dcs = InMemoryDcs::new("/shardkeeper", "host1");
    assert!(matches!(dcs.get("master").await, Err(DcsError::NotFound)));
    assert!(matches!(dcs.delete("master").await, Err(DcsError::NotFound)));
}

#[tokio::test]
async fn json_helpers_roundtrip_records() {
    let dcs = InMemoryDcs::new("/shardkeeper", "host1");
    let maintenance = Maintenance {
        initiated_by: "host1".to_string(),
        shardkeeper_paused: true,
        ..Maintenance::default()
    };
    dcs::set_json(&dcs, "maintenance", &maintenance).await.unwrap();
    let read: Maintenance = dcs::get_json(&dcs, "maintenance").await.unwrap();
    assert!(read.shardkeeper_paused);
    assert_eq!(read.initiated_by, "host1");
}

#[tokio::test]
async fn malformed_payload_is_reported() {
    let dcs = InMemoryDcs::new("/shardkeeper", "host1");
    dcs.set("maintenance", b"not-json".to_vec()).await.unwrap();
    let err = dcs::get_json::<Maintenance>(&dcs, "maintenance")
        .await
        .unwrap_err();
    assert!(matches!(err, DcsError::Malformed(_)));
}

#[tokio::test]
async fn ephemeral_nodes_vanish_on_session_loss() {
    let dcs = InMemoryDcs::new("/shardkeeper", "host1");
    dcs.set("master", b"\"host1\"".to_vec()).await.unwrap();
    dcs.set_ephemeral("health/host1", b"{}".to_vec())
        .await
        .unwrap();
    dcs.disconnect();
    dcs.reconnect();
    assert!(matches!(
        dcs.get("health/host1").await,
        Err(DcsError::NotFound)
    ));
    // persistent nodes survive the session
    assert!(dcs.get("master").await.is_ok());
}

#[tokio::test]
async fn manager_lock_is_exclusive_until_session_loss() {
    let first = InMemoryDcs::new("/shardkeeper", "host1");
    let second = first.attach("host2");

    assert!(first.acquire_lock("manager").await);
    // reacquiring an owned lock succeeds
    assert!(first.acquire_lock("manager").await);
    assert!(!second.acquire_lock("manager").await);

    let owner: LockOwner = dcs::get_json(&second, "manager").await.unwrap();
    assert_eq!(owner.hostname, "host1");

    first.disconnect();
    assert!(second.acquire_lock("manager").await);
    let owner: LockOwner = dcs::get_json(&second, "manager").await.unwrap();
    assert_eq!(owner.hostname, "host2");
}

#[tokio::test]
async fn release_lock_frees_the_slot() {
    let first = InMemoryDcs::new("/shardkeeper", "host1");
    let second = first.attach("host2");
    assert!(first.acquire_lock("manager").await);
    first.release_lock("manager").await.unwrap();
    assert!(second.acquire_lock("manager").await);
}

#[tokio::test]
async fn children_are_listed_sorted() {
    let dcs = InMemoryDcs::new("/shardkeeper", "host1");
    dcs.set("ha_nodes/db2", b"{\"priority\":100}".to_vec())
        .await
        .unwrap();
    dcs.set("ha_nodes/db1", b"{\"priority\":100}".to_vec())
        .await
        .unwrap();
    let children = dcs.get_children("ha_nodes").await.unwrap();
    assert_eq!(children, vec!["db1", "db2"]);
}

#[tokio::test]
async fn missing_prefix_children_report_not_found() {
    let dcs = InMemoryDcs::new("/shardkeeper", "host1");
    assert!(matches!(
        dcs.get_children("ha_nodes").await,
        Err(DcsError::NotFound)
    ));
}

#[tokio::test]
async fn tree_read_nests_child_payloads() {
    let dcs = InMemoryDcs::new("/shardkeeper", "host1");
    dcs.set("master", b"\"db1\"".to_vec()).await.unwrap();
    dcs.set("health/db1", b"{\"ping_ok\":true}".to_vec())
        .await
        .unwrap();
    let tree = dcs.get_tree("").await.unwrap();
    assert_eq!(tree["master"], "db1");
    assert_eq!(tree["health"]["db1"]["ping_ok"], true);
}

#[tokio::test]
async fn disconnect_callback_fires_on_session_loss() {
    let dcs = InMemoryDcs::new("/shardkeeper", "host1");
    let fired = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&fired);
    dcs.set_disconnect_callback(Some(Box::new(move || {
        flag.store(true, Ordering::SeqCst);
    })));
    dcs.disconnect();
    assert!(fired.load(Ordering::SeqCst));
    assert!(!dcs.is_connected());
    dcs.reconnect();
    assert!(dcs.is_connected());
}
