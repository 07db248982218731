// src/core/mod.rs

//! The central module containing the agent logic and data structures of Shardkeeper.

pub mod agent;
pub mod dcs;
pub mod engine;
pub mod topology;
pub mod types;

pub use types::{HostState, Maintenance, PoisonPill, ReplicaState, ShardStateMap, Switchover};
