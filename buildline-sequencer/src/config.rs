//! Runtime configuration.

use anyhow::{Context, Result};
use serde::Deserialize;

use buildline_core::protocol;

/// Runtime configuration data, parsed from the environment set on the job by
/// the control plane.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The sequencer's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,

    /// The name of the pipeline being built.
    pub pipeline: String,
    /// The name of the job running this build.
    pub job: String,
    /// Comma-separated stage names, in declared pipeline order.
    stages: String,
    /// The shared directory holding the env file and per-stage log files.
    pub log_dir: String,

    /// Line prefix signaling that a stage has started, forwarded as the first
    /// log point of each stage.
    #[serde(default = "default_start_sentinel")]
    pub start_sentinel: String,
    /// Line prefix signaling successful stage completion.
    #[serde(default = "default_success_sentinel")]
    pub success_sentinel: String,
    /// Line prefix signaling stage failure.
    #[serde(default = "default_failure_sentinel")]
    pub failure_sentinel: String,

    /// The build iteration of the pipeline, exported to stage containers.
    #[serde(default)]
    pub iteration: u64,
    /// Milliseconds between log file polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Optional wall-clock limit in seconds for the whole stage chain.
    #[serde(default)]
    pub time_limit_seconds: Option<u64>,

    /// Endpoint of the telemetry backend, if any.
    #[serde(default)]
    pub influxdb_url: Option<String>,
    /// Telemetry database name.
    #[serde(default = "default_influxdb_database")]
    pub influxdb_database: String,
}

fn default_start_sentinel() -> String {
    protocol::DEFAULT_START_SENTINEL.to_string()
}

fn default_success_sentinel() -> String {
    protocol::DEFAULT_SUCCESS_SENTINEL.to_string()
}

fn default_failure_sentinel() -> String {
    protocol::DEFAULT_FAILURE_SENTINEL.to_string()
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_influxdb_database() -> String {
    "buildline".to_string()
}

impl Config {
    /// Create a new config instance from the runtime environment.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        Ok(config)
    }

    /// The stage names to drive, preserving their declared order.
    pub fn stage_names(&self) -> Vec<String> {
        self.stages
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(String::from)
            .collect()
    }

    /// Create a test config driving the given stages out of a scratch dir.
    #[cfg(test)]
    pub fn new_test(log_dir: &std::path::Path, stages: &str) -> Self {
        Config {
            rust_log: "error".into(),
            pipeline: "api".into(),
            job: "api-1".into(),
            stages: stages.to_string(),
            log_dir: log_dir.to_string_lossy().into_owned(),
            start_sentinel: default_start_sentinel(),
            success_sentinel: default_success_sentinel(),
            failure_sentinel: default_failure_sentinel(),
            iteration: 7,
            poll_interval_ms: 10,
            time_limit_seconds: None,
            influxdb_url: None,
            influxdb_database: default_influxdb_database(),
        }
    }
}

#[cfg(test)]
mod config_test;
