// src/core/agent/aof.rs

//! Append-only-file policy enforcement for the local engine.

use anyhow::{Result, anyhow};

use super::Agent;
use crate::config::AofMode;

impl Agent {
    /// Brings the local engine's appendonly setting in line with the
    /// configured policy. With `OnReplicas`, the master runs without AOF as
    /// long as its HA replicas look healthy.
    pub(crate) async fn adjust_aof_mode(&self, master: &str) -> Result<()> {
        if self.config.engine.aof_mode == AofMode::Unspecified {
            return Ok(());
        }
        let local = self
            .shard
            .local()
            .ok_or_else(|| anyhow!("no local node in the shard registry"))?;
        let mut target_mode = true;
        if self.config.engine.aof_mode == AofMode::Off {
            target_mode = false;
        } else if self.config.engine.aof_mode == AofMode::OnReplicas
            && local.fqdn() == master
            && self.check_ha_replicas_running().await
        {
            target_mode = false;
        }
        let current_mode = local.get_appendonly().await?;
        if current_mode != target_mode {
            local.set_appendonly(target_mode).await??;
        }
        if !self.config.engine.aof_path.is_empty() && !target_mode {
            let path = std::path::Path::new(&self.config.engine.aof_path);
            if path.exists() {
                tokio::fs::remove_dir_all(path).await?;
            }
        }
        Ok(())
    }
}
