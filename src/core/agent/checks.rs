// src/core/agent/checks.rs

//! The HA-replicas-running check used by the Lost state and the AOF adjuster.

use tracing::{error, info, warn};

use super::Agent;
use crate::core::topology;

impl Agent {
    /// True when no peer is ahead of the local node in replication history
    /// and at least half the shard replicates from it with a live link.
    pub(crate) async fn check_ha_replicas_running(&self) -> bool {
        let hosts = self.shard.hosts().len();
        if hosts == 1 {
            info!("Check HA replicas ok: single node mode");
            return true;
        }
        let shard_state = match self.get_shard_state_from_db().await {
            Ok(state) => state,
            Err(err) => {
                error!("Check HA replicas failed: {err}");
                return false;
            }
        };
        let Some(local) = self.shard.local() else {
            error!("Check HA replicas failed: no local node");
            return false;
        };
        let Some(local_state) = shard_state.get(local.fqdn()) else {
            error!("Unable to find local node in state: {}", local.fqdn());
            return false;
        };

        let base_offset = topology::offset(local_state);
        let mut ahead_hosts = 0;
        let mut available_replicas = 0;
        for (host, host_state) in &shard_state {
            if topology::offset(host_state) > base_offset {
                warn!("Host {host} is ahead in replication history");
                ahead_hosts += 1;
            }
            if host_state.ping_ok && !host_state.is_master {
                if let Some(rs) = &host_state.replica_state {
                    if rs.master_link_state && local.match_host(&rs.master_host) {
                        available_replicas += 1;
                    }
                }
            }
        }

        if ahead_hosts > 0 {
            error!(
                "Not making local node online: {ahead_hosts} nodes are ahead in replication history"
            );
            return false;
        }

        if available_replicas >= hosts / 2 {
            info!("Check HA replicas ok: {available_replicas} replicas available");
            return true;
        }
        error!("Check HA replicas failed: {available_replicas} replicas available");
        false
    }
}
