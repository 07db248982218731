// src/core/agent/events.rs

//! Reports event durations to an external program, when one is configured.

use std::time::Duration;
use tracing::warn;

use crate::config::Config;

const REPORT_TIMEOUT: Duration = Duration::from_secs(30);

/// Handles reporting event durations to an external notify command.
pub struct TimingReporter {
    command: String,
    args_format: Vec<String>,
}

impl TimingReporter {
    pub fn from_config(config: &Config) -> Option<Self> {
        if config.event_timing_notify_command.is_empty() {
            return None;
        }
        Some(Self {
            command: config.event_timing_notify_command.clone(),
            args_format: config.event_timing_notify_args.clone(),
        })
    }

    /// Sends an event duration to the external program asynchronously.
    /// Never blocks the caller.
    pub fn report_timing(&self, event_type: &str, duration: Duration) {
        let command = self.command.clone();
        let args: Vec<String> = self
            .args_format
            .iter()
            .map(|template| {
                template
                    .replace("{event}", event_type)
                    .replace("{duration_ms}", &duration.as_millis().to_string())
            })
            .collect();
        let event_type = event_type.to_string();
        tokio::spawn(async move {
            let run = tokio::process::Command::new(&command)
                .args(&args)
                .output();
            match tokio::time::timeout(REPORT_TIMEOUT, run).await {
                Ok(Ok(output)) if output.status.success() => {}
                Ok(Ok(output)) => warn!(
                    "Timing reporter: external command failed for {event_type}: {}",
                    String::from_utf8_lossy(&output.stderr)
                ),
                Ok(Err(err)) => {
                    warn!("Timing reporter: external command failed for {event_type}: {err}");
                }
                Err(_) => warn!("Timing reporter: external command timed out for {event_type}"),
            }
        });
    }
}
