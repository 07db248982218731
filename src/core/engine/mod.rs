// src/core/engine/mod.rs

//! Typed access to the data-engine instances of the shard.

pub mod client;
pub mod node;
pub mod resp;
pub mod shard;

pub use node::Node;
pub use shard::{NodeConfiguration, Shard};

use thiserror::Error;

/// Failures surfaced by a data-engine instance or its connection.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("engine error: {0}")]
    Server(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("dns lookup failed for {0}")]
    Dns(String),

    #[error("operation on {0} is not possible - not local")]
    NotLocal(String),
}

impl EngineError {
    /// The engine is running a long script and cannot serve commands.
    pub fn is_busy(&self) -> bool {
        matches!(self, EngineError::Server(msg) if msg.starts_with("BUSY"))
    }

    /// The engine is still loading its dataset after a (re)start.
    pub fn is_loading(&self) -> bool {
        matches!(self, EngineError::Server(msg) if msg.starts_with("LOADING"))
    }
}

/// Outcome of the on-disk config rewrite that follows a durable config write.
/// The primary command result travels in the outer `Result`.
pub type Rewrite = Result<(), EngineError>;
