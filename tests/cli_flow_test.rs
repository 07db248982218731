// tests/cli_flow_test.rs

//! Operator-flow tests driving the agent's CLI entry points against the
//! in-memory coordination store.

use shardkeeper::config::Config;
use shardkeeper::core::agent::Agent;
use shardkeeper::core::dcs::memory::InMemoryDcs;
use shardkeeper::core::dcs::{self, Dcs};
use shardkeeper::core::engine::NodeConfiguration;
use std::sync::Arc;
use std::time::Duration;

fn test_agent(hostname: &str) -> (Agent, Arc<InMemoryDcs>) {
    let config: Config =
        toml::from_str(&format!("hostname = \"{hostname}\"")).expect("valid config");
    let dcs = Arc::new(InMemoryDcs::new("/shardkeeper", hostname));
    let agent = Agent::new(config, dcs.clone());
    (agent, dcs)
}

#[tokio::test]
async fn host_add_creates_membership_record() {
    let (mut agent, dcs) = test_agent("host1");
    let code = agent.cli_host_add("db1", None, false, true).await;
    assert_eq!(code, 0);
    let nc: NodeConfiguration = dcs::get_json(dcs.as_ref(), "ha_nodes/db1").await.unwrap();
    assert_eq!(nc.priority, 100);
}

#[tokio::test]
async fn host_add_with_priority_overrides_default() {
    let (mut agent, dcs) = test_agent("host1");
    let code = agent.cli_host_add("db1", Some(200), false, true).await;
    assert_eq!(code, 0);
    let nc: NodeConfiguration = dcs::get_json(dcs.as_ref(), "ha_nodes/db1").await.unwrap();
    assert_eq!(nc.priority, 200);
}

#[tokio::test]
async fn host_add_dry_run_reports_pending_changes() {
    let (mut agent, _dcs) = test_agent("host1");
    assert_eq!(agent.cli_host_add("db1", None, false, true).await, 0);

    // same priority: nothing to change
    assert_eq!(agent.cli_host_add("db1", Some(100), true, true).await, 0);
    // different priority: changes detected
    assert_eq!(agent.cli_host_add("db1", Some(50), true, true).await, 2);
    // unknown host: would be created
    assert_eq!(agent.cli_host_add("db9", Some(50), true, true).await, 2);
}

#[tokio::test]
async fn host_remove_is_idempotent() {
    let (mut agent, dcs) = test_agent("host1");
    assert_eq!(agent.cli_host_add("db1", None, false, true).await, 0);
    assert_eq!(agent.cli_host_remove("db1").await, 0);
    assert!(matches!(
        dcs.get("ha_nodes/db1").await,
        Err(shardkeeper::core::dcs::DcsError::NotFound)
    ));
    // removing again still succeeds
    assert_eq!(agent.cli_host_remove("db1").await, 0);
}

#[tokio::test]
async fn maintenance_schedule_and_status() {
    let (mut agent, _dcs) = test_agent("host1");
    assert_eq!(agent.cli_enable_maintenance(Duration::ZERO).await, 0);

    let maintenance = agent.get_maintenance().await.unwrap().expect("scheduled");
    assert!(!maintenance.shardkeeper_paused);
    assert_eq!(maintenance.initiated_by, "host1");

    // scheduling twice keeps the original record
    assert_eq!(agent.cli_enable_maintenance(Duration::ZERO).await, 0);

    assert_eq!(agent.cli_disable_maintenance(Duration::ZERO).await, 0);
    let maintenance = agent.get_maintenance().await.unwrap().expect("leaving");
    assert!(maintenance.should_leave);
}

#[tokio::test]
async fn maintenance_status_without_record_is_off() {
    let (mut agent, _dcs) = test_agent("host1");
    assert_eq!(agent.cli_get_maintenance().await, 0);
    assert!(agent.get_maintenance().await.unwrap().is_none());
}

#[tokio::test]
async fn switchover_makes_no_sense_on_single_node_shard() {
    let (mut agent, dcs) = test_agent("host1");
    dcs::set_json(
        dcs.as_ref(),
        "ha_nodes/host1",
        &NodeConfiguration { priority: 100 },
    )
    .await
    .unwrap();
    let code = agent.cli_switch("", "host1", Duration::ZERO, false).await;
    assert_eq!(code, 0);
    // nothing was scheduled
    assert!(matches!(
        dcs.get("current_switch").await,
        Err(shardkeeper::core::dcs::DcsError::NotFound)
    ));
}

#[tokio::test]
async fn switch_requires_a_direction() {
    let (mut agent, _dcs) = test_agent("host1");
    assert_eq!(agent.cli_switch("", "", Duration::ZERO, false).await, 1);
    assert_eq!(
        agent.cli_switch("db1", "db2", Duration::ZERO, false).await,
        1
    );
    assert_eq!(agent.cli_switch("db1", "", Duration::ZERO, true).await, 1);
}
