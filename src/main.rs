// src/main.rs

//! The main entry point for the Shardkeeper agent and its operator CLI.

use anyhow::Result;
use clap::{Parser, Subcommand};
use shardkeeper::config::Config;
use shardkeeper::core::agent::Agent;
use shardkeeper::core::dcs;
use std::time::Duration;
use tracing::error;
use tracing_subscriber::filter::EnvFilter;

#[derive(Parser)]
#[command(
    name = "shardkeeper",
    version,
    about = "Shardkeeper is an HA coordination agent for replicated in-memory key/value shards.",
    long_about = "Running without a subcommand starts the shardkeeper agent for the current node."
)]
struct Cli {
    /// Config file
    #[arg(short, long, default_value = "/etc/shardkeeper.toml")]
    config: String,

    /// Logging level (trace|debug|info|warn|error)
    #[arg(short, long)]
    loglevel: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print DCS-based shard state
    Info {
        #[arg(short, long)]
        verbose: bool,
    },
    /// Print engine state of shard hosts
    State {
        #[arg(short, long)]
        verbose: bool,
    },
    /// Manage hosts in the shard
    Host {
        #[command(subcommand)]
        command: HostCommand,
    },
    /// Perform a manual switchover of the master node
    Switch {
        /// Move the master away from this host (prefix match)
        #[arg(long, default_value = "")]
        from: String,
        /// Move the master to this host (prefix match)
        #[arg(long, default_value = "")]
        to: String,
        /// Schedule even without quorum and pin the active set to the target
        #[arg(long)]
        force: bool,
        /// Wait this long for completion (0 = schedule only)
        #[arg(long, default_value = "5m", value_parser = humantime::parse_duration)]
        wait: Duration,
    },
    /// Control maintenance mode
    Maintenance {
        #[command(subcommand)]
        command: MaintenanceCommand,
    },
    /// Abort a pending switchover
    Abort,
}

#[derive(Subcommand)]
enum HostCommand {
    /// List hosts in the shard
    List,
    /// Add a host to the shard
    Add {
        host: String,
        /// Host priority to become master
        #[arg(long)]
        priority: Option<i64>,
        /// Test suggested changes without applying them (exit 2 = changes detected)
        #[arg(long)]
        dry_run: bool,
        /// Do not check engine availability
        #[arg(long)]
        skip_engine_check: bool,
    },
    /// Remove a host from the shard
    Remove { host: String },
}

#[derive(Subcommand)]
enum MaintenanceCommand {
    /// Enable maintenance mode
    On {
        /// Wait this long for the agents to pause (0 = schedule only)
        #[arg(long, default_value = "5m", value_parser = humantime::parse_duration)]
        wait: Duration,
    },
    /// Disable maintenance mode
    Off {
        /// Wait this long for the agents to resume (0 = schedule only)
        #[arg(long, default_value = "5m", value_parser = humantime::parse_duration)]
        wait: Duration,
    },
    /// Show maintenance status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match Config::from_file(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Failed to load configuration from \"{}\": {err}", cli.config);
            std::process::exit(1);
        }
    };

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        cli.loglevel
            .clone()
            .unwrap_or_else(|| config.log_level.clone())
    });
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .compact()
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .init();

    let dcs = dcs::connect(&config.dcs, &config.hostname);
    let mut agent = Agent::new(config, dcs);

    let code = match cli.command {
        None => {
            if let Err(err) = agent.run().await {
                error!("Agent runtime error: {err}");
                1
            } else {
                0
            }
        }
        Some(Command::Info { verbose }) => agent.cli_info(verbose).await,
        Some(Command::State { verbose }) => agent.cli_state(verbose).await,
        Some(Command::Host { command }) => match command {
            HostCommand::List => agent.cli_host_list().await,
            HostCommand::Add {
                host,
                priority,
                dry_run,
                skip_engine_check,
            } => {
                agent
                    .cli_host_add(&host, priority, dry_run, skip_engine_check)
                    .await
            }
            HostCommand::Remove { host } => agent.cli_host_remove(&host).await,
        },
        Some(Command::Switch {
            from,
            to,
            force,
            wait,
        }) => agent.cli_switch(&from, &to, wait, force).await,
        Some(Command::Maintenance { command }) => match command {
            MaintenanceCommand::On { wait } => agent.cli_enable_maintenance(wait).await,
            MaintenanceCommand::Off { wait } => agent.cli_disable_maintenance(wait).await,
            MaintenanceCommand::Status => agent.cli_get_maintenance().await,
        },
        Some(Command::Abort) => agent.cli_abort().await,
    };
    std::process::exit(code);
}
