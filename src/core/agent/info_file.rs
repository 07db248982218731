// src/core/agent/info_file.rs

//! Advisory exporter: periodically snapshots the DCS tree to an on-disk file.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::config::Config;
use crate::core::dcs::Dcs;

pub(crate) async fn run_info_file_handler(
    config: Arc<Config>,
    dcs: Arc<dyn Dcs>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(config.info_file_handler_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let tree = match dcs.get_tree("").await {
                    Ok(tree) => tree,
                    Err(err) => {
                        error!("Info file handler: failed to get current dcs tree: {err}");
                        let _ = std::fs::remove_file(&config.info_file);
                        continue;
                    }
                };
                let data = match serde_json::to_vec(&tree) {
                    Ok(data) => data,
                    Err(err) => {
                        error!("Info file handler: failed to marshal dcs tree: {err}");
                        let _ = std::fs::remove_file(&config.info_file);
                        continue;
                    }
                };
                if let Err(err) = std::fs::write(&config.info_file, data) {
                    error!("Info file handler: failed to write info file: {err}");
                    let _ = std::fs::remove_file(&config.info_file);
                }
            }
            _ = cancel.cancelled() => return,
        }
    }
}
