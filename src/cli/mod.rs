// src/cli/mod.rs

//! Operator command implementations: inspection, host management, manual
//! switchover and maintenance control.
//!
//! Exit codes: 0 on success, 1 on generic failure, 2 when another switchover
//! is in progress or a dry run detected changes.

use chrono::Utc;
use serde_json::json;
use std::collections::BTreeMap;
use std::io::BufRead;
use std::time::Duration;
use tracing::{error, info};

use crate::core::agent::Agent;
use crate::core::dcs::{self, DcsError, LockOwner};
use crate::core::engine::{Node, NodeConfiguration};
use crate::core::types::{
    Maintenance, PATH_ACTIVE_NODES, PATH_CURRENT_SWITCH, PATH_HA_NODES, PATH_HEALTH_PREFIX,
    PATH_LAST_REJECTED_SWITCH, PATH_LAST_SWITCH, PATH_MAINTENANCE, PATH_MANAGER_LOCK,
    PATH_MASTER_NODE, PATH_POISON_PILL, PoisonPill, Switchover, SwitchoverCause,
};

fn match_prefix(hosts: &[String], prefix: &str) -> Vec<String> {
    hosts
        .iter()
        .filter(|host| host.starts_with(prefix))
        .cloned()
        .collect()
}

fn print_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(data) => println!("{data}"),
        Err(err) => error!("Failed to marshal output: {err}"),
    }
}

impl Agent {
    async fn prepare_cli(&self) -> Result<(), i32> {
        self.dcs().initialize().await;
        if let Err(err) = self.shard().update_hosts_info().await {
            error!("Unable to update hosts info: {err}");
            return Err(1);
        }
        Ok(())
    }

    /// Prints the DCS-based shard state.
    pub async fn cli_info(&mut self, verbose: bool) -> i32 {
        if let Err(code) = self.prepare_cli().await {
            return code;
        }
        if verbose {
            match self.dcs().get_tree("").await {
                Ok(tree) => print_json(&tree),
                Err(err) => {
                    error!("Failed to get tree: {err}");
                    return 1;
                }
            }
            return 0;
        }

        let mut data = serde_json::Map::new();

        let ha_nodes = match self.shard().shard_hosts_from_dcs().await {
            Ok(hosts) => hosts,
            Err(err) => {
                error!("Failed to get hosts: {err}");
                return 1;
            }
        };
        data.insert(PATH_HA_NODES.to_string(), json!(ha_nodes));

        let mut active_nodes = match self.get_active_nodes().await {
            Ok(nodes) => nodes,
            Err(err) => {
                error!("Failed to get active nodes: {err}");
                return 1;
            }
        };
        active_nodes.sort_unstable();
        data.insert(PATH_ACTIVE_NODES.to_string(), json!(active_nodes));

        let shard_state = match self.get_shard_state_from_dcs().await {
            Ok(state) => state,
            Err(err) => {
                error!("Failed to get shard state: {err}");
                return 1;
            }
        };
        let health: BTreeMap<String, String> = shard_state
            .iter()
            .map(|(host, state)| (host.clone(), state.to_string()))
            .collect();
        data.insert(PATH_HEALTH_PREFIX.to_string(), json!(health));

        for path in [PATH_LAST_SWITCH, PATH_CURRENT_SWITCH, PATH_LAST_REJECTED_SWITCH] {
            match dcs::get_json::<Switchover>(self.dcs().as_ref(), path).await {
                Ok(switchover) => {
                    data.insert(path.to_string(), json!(switchover.to_string()));
                }
                Err(DcsError::NotFound) => {}
                Err(err) => {
                    error!("Failed to get {path}: {err}");
                    return 1;
                }
            }
        }

        match dcs::get_json::<Maintenance>(self.dcs().as_ref(), PATH_MAINTENANCE).await {
            Ok(maintenance) => {
                data.insert(PATH_MAINTENANCE.to_string(), json!(maintenance.to_string()));
            }
            Err(DcsError::NotFound) => {}
            Err(err) => {
                error!("Failed to get {PATH_MAINTENANCE}: {err}");
                return 1;
            }
        }

        match dcs::get_json::<PoisonPill>(self.dcs().as_ref(), PATH_POISON_PILL).await {
            Ok(pill) => {
                data.insert(PATH_POISON_PILL.to_string(), json!(pill.to_string()));
            }
            Err(DcsError::NotFound) => {}
            Err(err) => {
                error!("Failed to get {PATH_POISON_PILL}: {err}");
                return 1;
            }
        }

        let manager = match dcs::get_json::<LockOwner>(self.dcs().as_ref(), PATH_MANAGER_LOCK).await
        {
            Ok(owner) => owner.hostname,
            Err(DcsError::NotFound) => String::new(),
            Err(err) => {
                error!("Failed to get {PATH_MANAGER_LOCK}: {err}");
                return 1;
            }
        };
        data.insert(PATH_MANAGER_LOCK.to_string(), json!(manager));

        let master = match dcs::get_json::<String>(self.dcs().as_ref(), PATH_MASTER_NODE).await {
            Ok(master) => master,
            Err(DcsError::NotFound) => String::new(),
            Err(err) => {
                error!("Failed to get {PATH_MASTER_NODE}: {err}");
                return 1;
            }
        };
        data.insert(PATH_MASTER_NODE.to_string(), json!(master));

        print_json(&serde_json::Value::Object(data));
        0
    }

    /// Prints the engine-observed state of every shard host.
    pub async fn cli_state(&mut self, verbose: bool) -> i32 {
        if let Err(code) = self.prepare_cli().await {
            return code;
        }
        let shard_state = match self.get_shard_state_from_db().await {
            Ok(state) => state,
            Err(err) => {
                error!("Failed to get state: {err}");
                return 1;
            }
        };
        if verbose {
            print_json(&json!(shard_state));
        } else {
            let compact: BTreeMap<String, String> = shard_state
                .iter()
                .map(|(host, state)| (host.clone(), state.to_string()))
                .collect();
            print_json(&json!(compact));
        }
        0
    }

    /// Performs a manual switchover of the master node.
    pub async fn cli_switch(
        &mut self,
        switch_from: &str,
        switch_to: &str,
        wait_timeout: Duration,
        switch_force: bool,
    ) -> i32 {
        if switch_from.is_empty() && switch_to.is_empty() {
            error!("Either --from or --to should be set");
            return 1;
        }
        if !switch_from.is_empty() && !switch_to.is_empty() {
            error!("Option --from and --to can't be used at the same time");
            return 1;
        }
        if !switch_from.is_empty() && switch_force {
            error!("Option --from and --force can't be used at the same time");
            return 1;
        }
        if let Err(code) = self.prepare_cli().await {
            return code;
        }

        let hosts = self.shard().hosts();
        if hosts.len() == 1 {
            info!("switchover makes no sense on single node shard");
            println!("switchover done");
            return 0;
        }

        let current_master =
            match dcs::get_json::<String>(self.dcs().as_ref(), PATH_MASTER_NODE).await {
                Ok(master) => master,
                Err(err) => {
                    error!("Failed to get current master: {err}");
                    return 1;
                }
            };
        let active_nodes = match self.get_active_nodes().await {
            Ok(nodes) => nodes,
            Err(err) => {
                error!("Unable to get active nodes: {err}");
                return 1;
            }
        };

        let mut from_host = String::new();
        let mut to_host = String::new();
        if !switch_to.is_empty() {
            let desired = match_prefix(&hosts, switch_to);
            if desired.is_empty() {
                error!("No nodes match '{switch_to}'");
                return 1;
            }
            if desired.len() > 1 {
                error!("More than one node matches '{switch_to}': {desired:?}");
                return 1;
            }
            to_host = desired.into_iter().next().expect("one element");
            if to_host == current_master {
                info!("Master is already on {to_host}, skipping...");
                println!("switchover done");
                return 0;
            }
            if !active_nodes.contains(&to_host) {
                error!("{to_host} is not active, can't switch to it");
                return 1;
            }
        } else {
            let not_desired = match_prefix(&hosts, switch_from);
            if not_desired.is_empty() {
                error!("No HA-nodes matches '{switch_from}'");
                return 1;
            }
            if !not_desired.contains(&current_master) {
                info!("Master is already not on {not_desired:?}, skipping...");
                println!("switchover done");
                return 0;
            }
            let candidates: Vec<&String> = active_nodes
                .iter()
                .filter(|node| !not_desired.contains(*node))
                .collect();
            if candidates.is_empty() {
                error!("There are no active nodes, not matching '{switch_from}'");
                return 1;
            }
            if not_desired.len() == 1 {
                from_host = not_desired.into_iter().next().expect("one element");
            } else {
                let states = match self.get_shard_state_from_db().await {
                    Ok(states) => states,
                    Err(err) => {
                        error!("No actual shard state: {err}");
                        return 1;
                    }
                };
                to_host = match self.select_most_desirable(&states, switch_from).await {
                    Ok(host) => host,
                    Err(err) => {
                        error!("No desirable node: {err}");
                        return 1;
                    }
                };
            }
        }

        match dcs::get_json::<Switchover>(self.dcs().as_ref(), PATH_CURRENT_SWITCH).await {
            Ok(switchover) => {
                error!("Another switchover in progress {switchover}");
                return 2;
            }
            Err(DcsError::NotFound) => {}
            Err(err) => {
                error!("Unable to get current switchover status: {err}");
                return 2;
            }
        }

        let mut switchover = Switchover {
            from: from_host,
            to: to_host.clone(),
            initiated_by: self.config().hostname.clone(),
            initiated_at: Utc::now(),
            cause: SwitchoverCause::Manual,
            ..Switchover::default()
        };
        if switch_force {
            switchover.run_count = 1;
            if let Err(err) =
                dcs::set_json(self.dcs().as_ref(), PATH_ACTIVE_NODES, &vec![to_host]).await
            {
                error!("Unable to update active nodes: {err}");
                return 1;
            }
        }

        match dcs::create_json(self.dcs().as_ref(), PATH_CURRENT_SWITCH, &switchover).await {
            Ok(()) => {}
            Err(DcsError::Exists) => {
                error!("Another switchover in progress");
                return 2;
            }
            Err(err) => {
                error!("Unable to create switchover in dcs: {err}");
                return 1;
            }
        }

        if wait_timeout.is_zero() {
            println!("switchover scheduled");
            return 0;
        }
        let deadline = tokio::time::Instant::now() + wait_timeout;
        let mut last_switchover = None;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if let Some(last) = self.get_last_switchover().await {
                if last.initiated_by == switchover.initiated_by
                    && last.initiated_at.timestamp() == switchover.initiated_at.timestamp()
                {
                    last_switchover = Some(last);
                    break;
                }
            }
        }
        match last_switchover.and_then(|s| s.result) {
            None => {
                error!("Switchover did not finish until deadline");
                1
            }
            Some(result) if !result.ok => {
                error!("Could not wait for switchover to complete because of errors");
                1
            }
            Some(_) => {
                println!("switchover done");
                0
            }
        }
    }

    /// Enables maintenance mode.
    pub async fn cli_enable_maintenance(&mut self, wait_timeout: Duration) -> i32 {
        self.dcs().initialize().await;
        let maintenance = Maintenance {
            initiated_by: self.config().hostname.clone(),
            initiated_at: Utc::now(),
            ..Maintenance::default()
        };
        match dcs::create_json(self.dcs().as_ref(), PATH_MAINTENANCE, &maintenance).await {
            Ok(()) | Err(DcsError::Exists) => {}
            Err(err) => {
                error!("Unable to create maintenance path in dcs: {err}");
                return 1;
            }
        }
        if wait_timeout.is_zero() {
            println!("maintenance scheduled");
            return 0;
        }
        let deadline = tokio::time::Instant::now() + wait_timeout;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_secs(1)).await;
            match self.get_maintenance().await {
                Ok(Some(m)) if m.shardkeeper_paused => {
                    println!("maintenance enabled");
                    return 0;
                }
                Ok(_) => {}
                Err(err) => error!("Unable to get maintenance status from dcs: {err}"),
            }
        }
        error!("Shardkeeper did not enter maintenance within timeout");
        1
    }

    /// Disables maintenance mode.
    pub async fn cli_disable_maintenance(&mut self, wait_timeout: Duration) -> i32 {
        self.dcs().initialize().await;
        let mut maintenance = match self.get_maintenance().await {
            Ok(Some(maintenance)) => maintenance,
            Ok(None) => {
                println!("maintenance disabled");
                return 0;
            }
            Err(err) => {
                error!("Unable to get maintenance status from dcs: {err}");
                return 1;
            }
        };
        maintenance.should_leave = true;
        if let Err(err) = dcs::set_json(self.dcs().as_ref(), PATH_MAINTENANCE, &maintenance).await {
            error!("Unable to update maintenance in dcs: {err}");
            return 1;
        }
        if wait_timeout.is_zero() {
            println!("maintenance disable scheduled");
            return 0;
        }
        let deadline = tokio::time::Instant::now() + wait_timeout;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_secs(1)).await;
            match self.get_maintenance().await {
                Ok(None) => {
                    println!("maintenance disabled");
                    return 0;
                }
                Ok(Some(_)) => {}
                Err(err) => error!("Unable to get maintenance status from dcs: {err}"),
            }
        }
        error!("Shardkeeper did not leave maintenance within timeout");
        1
    }

    /// Prints on/scheduled/off depending on current maintenance status.
    pub async fn cli_get_maintenance(&mut self) -> i32 {
        self.dcs().initialize().await;
        match self.get_maintenance().await {
            Ok(Some(maintenance)) => {
                if maintenance.shardkeeper_paused {
                    println!("on");
                } else {
                    println!("scheduled");
                }
                0
            }
            Ok(None) => {
                println!("off");
                0
            }
            Err(err) => {
                error!("Unable to get maintenance status: {err}");
                1
            }
        }
    }

    /// Removes the pending switchover record after interactive confirmation.
    pub async fn cli_abort(&mut self) -> i32 {
        self.dcs().initialize().await;
        match self.dcs().get(PATH_CURRENT_SWITCH).await {
            Err(DcsError::NotFound) => {
                println!("no active switchover");
                return 0;
            }
            Err(err) => {
                error!("Unable to get switchover status: {err}");
                return 1;
            }
            Ok(_) => {}
        }

        const PHRASE: &str = "yes, abort switch";
        println!("please, confirm aborting switchover by typing '{PHRASE}'");
        let mut response = String::new();
        if let Err(err) = std::io::stdin().lock().read_line(&mut response) {
            error!("Unable to parse response: {err}");
            return 1;
        }
        if response.trim() != PHRASE {
            println!("doesn't match, do nothing");
            return 1;
        }

        if let Err(err) = self.dcs().delete(PATH_CURRENT_SWITCH).await {
            error!("Unable to remove switchover path from dcs: {err}");
            return 1;
        }
        println!("switchover aborted");
        0
    }

    /// Prints the list of HA hosts from the DCS.
    pub async fn cli_host_list(&mut self) -> i32 {
        self.dcs().initialize().await;
        let mut hosts = match self.shard().shard_hosts_from_dcs().await {
            Ok(hosts) => hosts,
            Err(err) => {
                error!("Failed to get hosts: {err}");
                return 1;
            }
        };
        hosts.sort_unstable();
        print_json(&json!({ PATH_HA_NODES: hosts }));
        0
    }

    /// Adds a host to the HA membership list.
    pub async fn cli_host_add(
        &mut self,
        host: &str,
        priority: Option<i64>,
        dry_run: bool,
        skip_engine_check: bool,
    ) -> i32 {
        if let Some(priority) = priority {
            if priority < 0 {
                error!("Priority must be >= 0. Got: {priority}");
                return 1;
            }
        }
        self.dcs().initialize().await;

        // membership prefix probably does not exist yet
        match self.dcs().create(PATH_HA_NODES, Vec::new()).await {
            Ok(()) | Err(DcsError::Exists) => {}
            Err(err) => {
                error!("Unable to create dcs path {PATH_HA_NODES}: {err}");
                return 1;
            }
        }

        if !skip_engine_check {
            let node = Node::new(std::sync::Arc::new(self.config().clone()), host).await;
            if let Err(err) = node.get_info().await {
                error!("Node {host} is dead: {err}");
                return 1;
            }
        }

        if !dry_run && priority.is_none() {
            match dcs::set_json(
                self.dcs().as_ref(),
                &dcs::join_path(&[PATH_HA_NODES, host]),
                &NodeConfiguration::default(),
            )
            .await
            {
                Ok(()) | Err(DcsError::Exists) => {}
                Err(err) => {
                    error!("Unable to create dcs path for {host}: {err}");
                    return 1;
                }
            }
        }

        let changes = match self.process_priority(priority, dry_run, host).await {
            Ok(changes) => changes,
            Err(err) => {
                error!("Unable to process priority for {host}: {err}");
                return 1;
            }
        };

        if dry_run {
            if !changes {
                println!("dry run finished: no changes detected");
                return 0;
            }
            return 2;
        }
        println!("host has been added");
        0
    }

    /// Removes a host from the HA membership list.
    pub async fn cli_host_remove(&mut self, host: &str) -> i32 {
        self.dcs().initialize().await;
        match self
            .dcs()
            .delete(&dcs::join_path(&[PATH_HA_NODES, host]))
            .await
        {
            Ok(()) | Err(DcsError::NotFound) => {
                println!("host has been removed");
                0
            }
            Err(err) => {
                error!("Unable to delete dcs path for {host}: {err}");
                1
            }
        }
    }

    async fn process_priority(
        &self,
        priority: Option<i64>,
        dry_run: bool,
        host: &str,
    ) -> anyhow::Result<bool> {
        let mut target_conf = NodeConfiguration::default();
        if let Some(priority) = priority {
            target_conf.priority = priority;
        }
        if dry_run {
            let hosts = self.shard().shard_hosts_from_dcs().await?;
            if !hosts.iter().any(|h| h == host) {
                println!("dry run: node can be created");
                return Ok(true);
            }
            let nc = self.shard().node_configuration(host).await?;
            if nc.priority == target_conf.priority {
                println!("dry run: node already has priority {} set", nc.priority);
                return Ok(false);
            }
            println!(
                "dry run: node priority can be set to {} (current priority {})",
                target_conf.priority, nc.priority
            );
            return Ok(true);
        }
        dcs::set_json(
            self.dcs().as_ref(),
            &dcs::join_path(&[PATH_HA_NODES, host]),
            &target_conf,
        )
        .await?;
        Ok(true)
    }
}
