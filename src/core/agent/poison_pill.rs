// src/core/agent/poison_pill.rs

//! The fencing protocol: a one-slot DCS record instructing a specific host to
//! take itself offline.

use anyhow::Result;
use chrono::Utc;
use std::time::Duration;
use tracing::{error, info};

use super::Agent;
use crate::core::dcs::{self, DcsError};
use crate::core::types::{PATH_POISON_PILL, PoisonPill};

impl Agent {
    pub(crate) async fn get_poison_pill(&self) -> Result<Option<PoisonPill>, DcsError> {
        match dcs::get_json::<PoisonPill>(self.dcs.as_ref(), PATH_POISON_PILL).await {
            Ok(pill) => Ok(Some(pill)),
            Err(DcsError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Issues a pill for `target_host`. A pill already targeting the same
    /// host makes this a no-op at the DCS level (atomic create).
    pub(crate) async fn issue_poison_pill(&self, target_host: &str) -> Result<(), DcsError> {
        let pill = PoisonPill {
            target_host: target_host.to_string(),
            initiated_by: self.config.hostname.clone(),
            initiated_at: Utc::now(),
            applied: false,
        };
        dcs::create_json(self.dcs.as_ref(), PATH_POISON_PILL, &pill).await
    }

    /// Applies the pill if we are the target: go offline (or restart when the
    /// offline check itself fails) and acknowledge with `applied=true`.
    pub(crate) async fn apply_poison_pill(&self, pill: &PoisonPill) -> Result<()> {
        if pill.target_host != self.config.hostname {
            info!("Poison pill issued for {}: not local host", pill.target_host);
            return Ok(());
        }
        let Some(local) = self.shard.local() else {
            return Ok(());
        };
        match local.is_offline().await {
            Err(err) => {
                error!("Unable to check offline status for poison pill apply: {err}");
                return local.restart().await.map_err(Into::into);
            }
            Ok(false) => {
                info!(
                    "Applying poison pill issued by {}: Going offline",
                    pill.initiated_by
                );
                local.set_offline().await?;
            }
            Ok(true) => {}
        }
        let mut acknowledged = pill.clone();
        acknowledged.applied = true;
        dcs::set_json(self.dcs.as_ref(), PATH_POISON_PILL, &acknowledged)
            .await
            .map_err(Into::into)
    }

    pub(crate) async fn clear_poison_pill(&self) -> Result<(), DcsError> {
        self.dcs.delete(PATH_POISON_PILL).await
    }

    /// Waits for the victim to acknowledge the pill, bounded by `timeout`.
    pub(crate) async fn wait_poison_pill(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut last_seen = PoisonPill::default();
        while tokio::time::Instant::now() < deadline && !self.cancel.is_cancelled() {
            tokio::time::sleep(Duration::from_secs(1)).await;
            match dcs::get_json::<PoisonPill>(self.dcs.as_ref(), PATH_POISON_PILL).await {
                Ok(pill) => last_seen = pill,
                Err(err) => {
                    error!("Wait for poison pill apply: {err}");
                    continue;
                }
            }
            if let Err(err) = self.apply_poison_pill(&last_seen).await {
                error!("Poison pill apply: {err}");
            }
            if last_seen.applied {
                break;
            }
        }
        if !last_seen.applied {
            error!(
                "Poison pill for {} was not applied within timeout",
                last_seen.target_host
            );
        }
    }
}
