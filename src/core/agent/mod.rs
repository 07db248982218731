// src/core/agent/mod.rs

//! The per-node agent: a periodic state machine (Init / Manager / Candidate /
//! Lost / Maintenance) that drives shard topology through the DCS and the
//! engine node adapters.

pub mod active_nodes;
pub mod aof;
pub mod candidate;
pub mod checks;
pub mod events;
pub mod failover;
pub mod health;
pub mod info_file;
pub mod lost;
pub mod maintenance;
pub mod manager;
pub mod master;
pub mod poison_pill;
pub mod repair;
pub mod snapshot;
pub mod stale;
pub mod switchover;

use anyhow::{Context, Result, anyhow};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::core::dcs::Dcs;
use crate::core::engine::Shard;
use crate::core::types::PATH_MANAGER_LOCK;
use events::TimingReporter;

/// Agent state-machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum AgentState {
    Init,
    Manager,
    Candidate,
    Lost,
    Maintenance,
}

/// Mutable per-agent bookkeeping touched only by the main loop.
#[derive(Default)]
pub struct AgentRuntime {
    /// First failure instant per host, for failover timing and inactivation.
    pub node_fail_time: HashMap<String, Instant>,
    /// When the manager first saw a suspected partition, per master.
    pub split_time: HashMap<String, Instant>,
    /// How long the local replica has reported no replica substate.
    pub dcs_diverge_time: Option<Instant>,
    /// How long the local replica has been considered stale.
    pub repl_fail_time: Option<Instant>,
}

/// Main application structure: one agent process per host.
pub struct Agent {
    pub(crate) config: Arc<Config>,
    pub(crate) dcs: Arc<dyn Dcs>,
    pub(crate) shard: Arc<Shard>,
    pub(crate) runtime: AgentRuntime,
    pub(crate) critical: Arc<AtomicBool>,
    pub(crate) cancel: CancellationToken,
    pub(crate) reporter: Option<TimingReporter>,
    state: AgentState,
    daemon_lock: Option<std::fs::File>,
}

/// Marks a manager-side procedure during which DCS loss is fatal.
/// Cleared when dropped.
pub(crate) struct CriticalSection {
    flag: Arc<AtomicBool>,
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

impl Agent {
    pub fn new(config: Config, dcs: Arc<dyn Dcs>) -> Self {
        let config = Arc::new(config);
        let shard = Shard::new(Arc::clone(&config), Arc::clone(&dcs));
        let reporter = TimingReporter::from_config(&config);
        Self {
            config,
            dcs,
            shard,
            runtime: AgentRuntime::default(),
            critical: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            reporter,
            state: AgentState::Init,
            daemon_lock: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn dcs(&self) -> &Arc<dyn Dcs> {
        &self.dcs
    }

    pub(crate) fn shard(&self) -> &Arc<Shard> {
        &self.shard
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn enter_critical(&self) -> CriticalSection {
        self.critical.store(true, Ordering::SeqCst);
        CriticalSection {
            flag: Arc::clone(&self.critical),
        }
    }

    fn lock_daemon_file(&mut self) -> Result<()> {
        let path = &self.config.daemon_lock_file;
        if let Some(dir) = std::path::Path::new(path).parent() {
            std::fs::create_dir_all(dir).ok();
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .with_context(|| format!("Unable to open daemon lock file {path}"))?;
        // SAFETY: the fd is valid for the lifetime of `file`, held below.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(anyhow!(
                "Unable to acquire daemon lock on {path}: another instance is running"
            ));
        }
        self.daemon_lock = Some(file);
        Ok(())
    }

    fn install_disconnect_callback(&self) {
        let critical = Arc::clone(&self.critical);
        self.dcs.set_disconnect_callback(Some(Box::new(move || {
            if critical.load(Ordering::SeqCst) {
                error!("Lost dcs connection in critical section");
                std::process::exit(1);
            }
            info!("Lost dcs connection in non-critical section");
        })));
    }

    fn spawn_signal_handler(&self) {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut terminate =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("installing SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
            cancel.cancel();
        });
    }

    /// Enters the main agent loop; returns when cancelled.
    pub async fn run(mut self) -> Result<()> {
        self.lock_daemon_file()?;
        self.install_disconnect_callback();
        self.spawn_signal_handler();

        tokio::spawn(health::run_health_publisher(
            Arc::clone(&self.config),
            Arc::clone(&self.shard),
            Arc::clone(&self.dcs),
            self.cancel.clone(),
        ));
        tokio::spawn(info_file::run_info_file_handler(
            Arc::clone(&self.config),
            Arc::clone(&self.dcs),
            self.cancel.clone(),
        ));

        let cancel = self.cancel.clone();
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    loop {
                        info!("Shardkeeper state: {}", self.state);
                        let next_state = match self.state {
                            AgentState::Init => self.state_init().await,
                            AgentState::Manager => self.state_manager().await,
                            AgentState::Candidate => self.state_candidate().await,
                            AgentState::Lost => self.state_lost().await,
                            AgentState::Maintenance => self.state_maintenance().await,
                        };
                        if next_state == self.state {
                            break;
                        }
                        self.state = next_state;
                    }
                }
                _ = cancel.cancelled() => {
                    self.dcs.close().await;
                    return Ok(());
                }
            }
        }
    }

    async fn state_init(&mut self) -> AgentState {
        if !self.dcs.wait_connected(self.config.dcs_wait_timeout).await {
            if self.maintenance_file_exists() {
                return AgentState::Maintenance;
            }
            return AgentState::Init;
        }
        self.dcs.initialize().await;
        if self.dcs.acquire_lock(PATH_MANAGER_LOCK).await {
            return AgentState::Manager;
        }
        AgentState::Candidate
    }
}
