// src/core/agent/health.rs

//! The health publisher: a separate task writing the local node's state to an
//! ephemeral DCS node so peers can judge this host without reaching it.

use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::snapshot::host_state_from_db;
use crate::config::Config;
use crate::core::dcs::{self, Dcs};
use crate::core::engine::Shard;
use crate::core::types::PATH_HEALTH_PREFIX;

pub(crate) async fn run_health_publisher(
    config: Arc<Config>,
    shard: Arc<Shard>,
    dcs: Arc<dyn Dcs>,
    cancel: CancellationToken,
) {
    let path = dcs::join_path(&[PATH_HEALTH_PREFIX, &config.hostname]);
    let mut ticker = tokio::time::interval(config.health_check_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_published = Instant::now();
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match shard.local() {
                    Some(local) => {
                        let state = host_state_from_db(&config, &shard, local.fqdn()).await;
                        info!("healthcheck: {state}");
                        match dcs::set_ephemeral_json(dcs.as_ref(), &path, &state).await {
                            Ok(()) => last_published = Instant::now(),
                            Err(err) => error!("Failed to set healthcheck status to dcs: {err}"),
                        }
                    }
                    None => {
                        // nothing to publish; stop advertising a state nobody
                        // is refreshing so peers see this host vanish
                        if last_published.elapsed() > config.health_check_interval * 5 {
                            let _ = dcs.delete(&path).await;
                        }
                    }
                }
            }
            _ = cancel.cancelled() => return,
        }
    }
}
