// src/core/dcs/memory.rs

//! In-memory coordination store with session semantics.
//!
//! Implements the full `Dcs` contract: ephemeral nodes and locks are tied to a
//! session counter and vanish when the session is dropped, which is what the
//! agent tests exercise. `disconnect`/`reconnect` simulate session loss.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use super::{Dcs, DcsError, DisconnectCallback, LockOwner};

#[derive(Default)]
struct Store {
    nodes: BTreeMap<String, Vec<u8>>,
    // path -> owning session, for ephemerals and locks
    ephemeral_owner: HashMap<String, u64>,
}

pub struct InMemoryDcs {
    namespace: String,
    hostname: String,
    store: Arc<Mutex<Store>>,
    connected: AtomicBool,
    session: AtomicU64,
    callback: Mutex<Option<DisconnectCallback>>,
}

impl InMemoryDcs {
    pub fn new(namespace: &str, hostname: &str) -> Self {
        Self {
            namespace: namespace.trim_matches('/').to_string(),
            hostname: hostname.to_string(),
            store: Arc::new(Mutex::new(Store::default())),
            connected: AtomicBool::new(true),
            session: AtomicU64::new(1),
            callback: Mutex::new(None),
        }
    }

    /// A second handle over the same store, as a different agent identity.
    /// Lets tests run several "agents" against one coordination state.
    pub fn attach(&self, hostname: &str) -> Self {
        Self {
            namespace: self.namespace.clone(),
            hostname: hostname.to_string(),
            store: Arc::clone(&self.store),
            connected: AtomicBool::new(true),
            session: AtomicU64::new(self.session.load(Ordering::SeqCst) + 1000),
            callback: Mutex::new(None),
        }
    }

    /// Simulates session loss: drops this session's ephemerals and locks,
    /// flips the connection state and fires the disconnect callback.
    pub fn disconnect(&self) {
        let session = self.session.load(Ordering::SeqCst);
        {
            let mut store = self.store.lock();
            let owned: Vec<String> = store
                .ephemeral_owner
                .iter()
                .filter(|(_, owner)| **owner == session)
                .map(|(path, _)| path.clone())
                .collect();
            for path in owned {
                store.ephemeral_owner.remove(&path);
                store.nodes.remove(&path);
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        if let Some(callback) = self.callback.lock().as_ref() {
            callback();
        }
    }

    /// Re-establishes the connection under a fresh session.
    pub fn reconnect(&self) {
        self.session.fetch_add(1, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
    }

    fn normalize(&self, path: &str) -> String {
        path.trim_matches('/').to_string()
    }

    fn ensure_connected(&self) -> Result<(), DcsError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(DcsError::Unavailable("session lost".to_string()))
        }
    }
}

#[async_trait]
impl Dcs for InMemoryDcs {
    async fn initialize(&self) {}

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn wait_connected(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_connected() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, DcsError> {
        self.ensure_connected()?;
        let path = self.normalize(path);
        let store = self.store.lock();
        store.nodes.get(&path).cloned().ok_or(DcsError::NotFound)
    }

    async fn set(&self, path: &str, data: Vec<u8>) -> Result<(), DcsError> {
        self.ensure_connected()?;
        let path = self.normalize(path);
        let mut store = self.store.lock();
        store.nodes.insert(path, data);
        Ok(())
    }

    async fn create(&self, path: &str, data: Vec<u8>) -> Result<(), DcsError> {
        self.ensure_connected()?;
        let path = self.normalize(path);
        let mut store = self.store.lock();
        if store.nodes.contains_key(&path) {
            return Err(DcsError::Exists);
        }
        store.nodes.insert(path, data);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), DcsError> {
        self.ensure_connected()?;
        let path = self.normalize(path);
        let mut store = self.store.lock();
        if store.nodes.remove(&path).is_none() {
            return Err(DcsError::NotFound);
        }
        store.ephemeral_owner.remove(&path);
        Ok(())
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>, DcsError> {
        self.ensure_connected()?;
        let prefix = format!("{}/", self.normalize(path));
        let store = self.store.lock();
        let mut children: Vec<String> = store
            .nodes
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(|rest| rest.to_string())
            .collect();
        if children.is_empty() && !store.nodes.contains_key(&self.normalize(path)) {
            return Err(DcsError::NotFound);
        }
        children.sort_unstable();
        Ok(children)
    }

    async fn get_tree(&self, prefix: &str) -> Result<Value, DcsError> {
        self.ensure_connected()?;
        let prefix = self.normalize(prefix);
        let store = self.store.lock();
        let mut tree = Value::Object(serde_json::Map::new());
        for (path, raw) in &store.nodes {
            let rest = if prefix.is_empty() {
                path.as_str()
            } else if let Some(rest) = path.strip_prefix(&format!("{prefix}/")) {
                rest
            } else if path == &prefix {
                path.rsplit('/').next().unwrap_or(path.as_str())
            } else {
                continue;
            };
            let value: Value = serde_json::from_slice(raw)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(raw).into_owned()));
            let mut cursor = &mut tree;
            let mut parts = rest.split('/').peekable();
            while let Some(part) = parts.next() {
                let object = cursor
                    .as_object_mut()
                    .expect("tree nodes are always objects");
                if parts.peek().is_none() {
                    // an inner node may carry both a value and children;
                    // children win, a bare value fills an empty slot
                    let slot = object
                        .entry(part.to_string())
                        .or_insert(Value::Object(serde_json::Map::new()));
                    if slot.as_object().is_some_and(|m| m.is_empty()) {
                        *slot = value;
                    }
                    break;
                }
                let slot = object
                    .entry(part.to_string())
                    .or_insert(Value::Object(serde_json::Map::new()));
                if !slot.is_object() {
                    *slot = Value::Object(serde_json::Map::new());
                }
                cursor = slot;
            }
        }
        Ok(tree)
    }

    async fn set_ephemeral(&self, path: &str, data: Vec<u8>) -> Result<(), DcsError> {
        self.ensure_connected()?;
        let path = self.normalize(path);
        let session = self.session.load(Ordering::SeqCst);
        let mut store = self.store.lock();
        store.nodes.insert(path.clone(), data);
        store.ephemeral_owner.insert(path, session);
        Ok(())
    }

    async fn acquire_lock(&self, path: &str) -> bool {
        if self.ensure_connected().is_err() {
            return false;
        }
        let path = self.normalize(path);
        let session = self.session.load(Ordering::SeqCst);
        let mut store = self.store.lock();
        match store.ephemeral_owner.get(&path) {
            Some(owner) if *owner == session => true,
            Some(_) => false,
            None => {
                let owner = LockOwner {
                    hostname: self.hostname.clone(),
                };
                let raw = serde_json::to_vec(&owner).expect("lock owner serializes");
                store.nodes.insert(path.clone(), raw);
                store.ephemeral_owner.insert(path, session);
                true
            }
        }
    }

    async fn release_lock(&self, path: &str) -> Result<(), DcsError> {
        self.ensure_connected()?;
        let path = self.normalize(path);
        let session = self.session.load(Ordering::SeqCst);
        let mut store = self.store.lock();
        if store.ephemeral_owner.get(&path) == Some(&session) {
            store.ephemeral_owner.remove(&path);
            store.nodes.remove(&path);
        }
        Ok(())
    }

    fn set_disconnect_callback(&self, callback: Option<DisconnectCallback>) {
        *self.callback.lock() = callback;
    }

    async fn close(&self) {
        self.disconnect();
    }
}
