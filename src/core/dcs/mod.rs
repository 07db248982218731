// src/core/dcs/mod.rs

//! The coordination-store capability used by the agent.
//!
//! The agent only depends on the `Dcs` trait: leases, ephemeral nodes, atomic
//! create/set/delete, child listing, tree reads and a single cross-agent lock.
//! A ZooKeeper-backed implementation is wired in by the deployment; the
//! in-memory store in [`memory`] backs process-local runs and the test suite.

pub mod memory;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::DcsConfig;

/// Failures surfaced by the coordination store.
#[derive(Error, Debug)]
pub enum DcsError {
    #[error("path not found")]
    NotFound,

    #[error("path already exists")]
    Exists,

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("coordination store unavailable: {0}")]
    Unavailable(String),
}

/// Payload of the manager lock node.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct LockOwner {
    #[serde(default)]
    pub hostname: String,
}

/// Invoked from the store's own task on session loss. Must only flip the
/// critical-section fatal flag (and terminate if it is set).
pub type DisconnectCallback = Box<dyn Fn() + Send + Sync>;

/// ZooKeeper-class storage contract: session leases, ephemeral nodes and a
/// per-shard exclusive lock. All paths are relative to the configured root.
#[async_trait]
pub trait Dcs: Send + Sync {
    /// Establishes the session and performs idempotent base-path setup.
    async fn initialize(&self);

    fn is_connected(&self) -> bool;

    /// Blocks until the session is established or the timeout elapses.
    async fn wait_connected(&self, timeout: Duration) -> bool;

    async fn get(&self, path: &str) -> Result<Vec<u8>, DcsError>;

    async fn set(&self, path: &str, data: Vec<u8>) -> Result<(), DcsError>;

    /// Atomic create: fails with [`DcsError::Exists`] if the path is present.
    async fn create(&self, path: &str, data: Vec<u8>) -> Result<(), DcsError>;

    async fn delete(&self, path: &str) -> Result<(), DcsError>;

    async fn get_children(&self, path: &str) -> Result<Vec<String>, DcsError>;

    /// Reads the whole subtree under `prefix` as a nested JSON map.
    async fn get_tree(&self, prefix: &str) -> Result<serde_json::Value, DcsError>;

    /// Writes a node tied to the current session; removed on session loss.
    async fn set_ephemeral(&self, path: &str, data: Vec<u8>) -> Result<(), DcsError>;

    /// Attempts to take (or confirm holding) the lock at `path`.
    async fn acquire_lock(&self, path: &str) -> bool;

    async fn release_lock(&self, path: &str) -> Result<(), DcsError>;

    fn set_disconnect_callback(&self, callback: Option<DisconnectCallback>);

    async fn close(&self);
}

/// Joins path components with the store separator.
pub fn join_path(parts: &[&str]) -> String {
    parts.join("/")
}

/// Reads and JSON-decodes the node at `path`.
pub async fn get_json<T: DeserializeOwned>(dcs: &dyn Dcs, path: &str) -> Result<T, DcsError> {
    let raw = dcs.get(path).await?;
    serde_json::from_slice(&raw).map_err(|err| DcsError::Malformed(err.to_string()))
}

/// JSON-encodes `value` and writes it to `path`, creating the node if needed.
pub async fn set_json<T: Serialize>(dcs: &dyn Dcs, path: &str, value: &T) -> Result<(), DcsError> {
    let raw = serde_json::to_vec(value).map_err(|err| DcsError::Malformed(err.to_string()))?;
    dcs.set(path, raw).await
}

/// JSON-encodes `value` and atomically creates the node at `path`.
pub async fn create_json<T: Serialize>(
    dcs: &dyn Dcs,
    path: &str,
    value: &T,
) -> Result<(), DcsError> {
    let raw = serde_json::to_vec(value).map_err(|err| DcsError::Malformed(err.to_string()))?;
    dcs.create(path, raw).await
}

/// JSON-encodes `value` and writes it as an ephemeral node at `path`.
pub async fn set_ephemeral_json<T: Serialize>(
    dcs: &dyn Dcs,
    path: &str,
    value: &T,
) -> Result<(), DcsError> {
    let raw = serde_json::to_vec(value).map_err(|err| DcsError::Malformed(err.to_string()))?;
    dcs.set_ephemeral(path, raw).await
}

/// Opens a store for the configured deployment.
///
/// The ZooKeeper-class backend is an external collaborator; until it is wired
/// in, sessions are served by the in-memory implementation rooted at the
/// configured namespace.
pub fn connect(config: &DcsConfig, hostname: &str) -> Arc<dyn Dcs> {
    Arc::new(memory::InMemoryDcs::new(&config.namespace, hostname))
}
