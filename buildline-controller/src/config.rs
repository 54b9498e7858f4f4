//! Runtime configuration.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use serde::Deserialize;

use buildline_core::protocol;

/// The shared, hot-swappable view of the currently configured pipelines.
///
/// The change watcher replaces this map wholesale on every config reload; the
/// dispatcher and the trigger handlers only ever read it.
pub type PipelinesMap = Arc<ArcSwap<HashMap<String, PipelineConfig>>>;

/// Runtime configuration data, parsed from the environment.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The port serving the trigger API, health & metrics endpoints.
    pub http_port: u16,
    /// The Kubernetes namespace in which build jobs are created.
    pub namespace: String,

    /// Path to the YAML pipelines config file, reloaded every check cycle.
    pub pipelines_file: String,
    /// Path of the pipeline spec file within each watched repository.
    #[serde(default = "default_spec_file")]
    pub spec_file: String,

    /// The path to the state database on disk.
    #[serde(default = "crate::database::default_data_path")]
    pub storage_data_path: String,
    /// The directory holding cached bare clones of watched repositories.
    #[serde(default = "default_git_data_path")]
    pub git_data_path: String,

    /// Timeout in seconds applied to each git and cluster API call.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_seconds: u64,

    /// Image used for the in-job stage sequencer container.
    #[serde(default = "default_sequencer_image")]
    pub sequencer_image: String,
    /// Image used for docker build/push stage containers.
    #[serde(default = "default_stage_shell_image")]
    pub stage_shell_image: String,
    /// The shared directory mounted into every container of a build job.
    #[serde(default = "default_shared_dir")]
    pub shared_dir: String,

    /// Line prefix signaling that a stage has started.
    #[serde(default = "default_start_sentinel")]
    pub start_sentinel: String,
    /// Line prefix signaling successful stage completion.
    #[serde(default = "default_success_sentinel")]
    pub success_sentinel: String,
    /// Line prefix signaling stage failure.
    #[serde(default = "default_failure_sentinel")]
    pub failure_sentinel: String,

    /// Wall-clock limit in seconds applied to a job's stage chain.
    #[serde(default = "default_job_time_limit")]
    pub job_time_limit_seconds: u64,
    /// Hard deadline in seconds after which the cluster kills a job's pod.
    /// Kept above the stage chain limit so the sequencer reports the timeout.
    #[serde(default = "default_job_active_deadline")]
    pub job_active_deadline_seconds: u64,

    /// Endpoint of the telemetry backend handed to dispatched jobs.
    #[serde(default)]
    pub influxdb_url: Option<String>,
    /// Telemetry database name handed to dispatched jobs.
    #[serde(default = "default_influxdb_database")]
    pub influxdb_database: String,
}

fn default_spec_file() -> String {
    protocol::DEFAULT_SPEC_FILE.to_string()
}

fn default_git_data_path() -> String {
    "/usr/local/buildline/repos".to_string()
}

fn default_call_timeout() -> u64 {
    5
}

fn default_sequencer_image() -> String {
    "buildline/sequencer:latest".to_string()
}

fn default_stage_shell_image() -> String {
    "alpine:3.9".to_string()
}

fn default_shared_dir() -> String {
    "/buildline".to_string()
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

fn default_job_time_limit() -> u64 {
    3600
}

fn default_job_active_deadline() -> u64 {
    4000
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

    /// Create a test config backed by a temp dir for storage.
    #[cfg(test)]
    pub fn new_test() -> Result<(Arc<Config>, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir().context("error creating temp dir for test")?;
        let config = Config {
            rust_log: "error".into(),
            http_port: 8080,
            namespace: "default".into(),
            pipelines_file: tmpdir.path().join("config.yml").to_string_lossy().into_owned(),
            spec_file: default_spec_file(),
            storage_data_path: tmpdir.path().join("db").to_string_lossy().into_owned(),
            git_data_path: tmpdir.path().join("repos").to_string_lossy().into_owned(),
            call_timeout_seconds: default_call_timeout(),
            sequencer_image: default_sequencer_image(),
            stage_shell_image: default_stage_shell_image(),
            shared_dir: default_shared_dir(),
            start_sentinel: default_start_sentinel(),
            success_sentinel: default_success_sentinel(),
            failure_sentinel: default_failure_sentinel(),
            job_time_limit_seconds: default_job_time_limit(),
            job_active_deadline_seconds: default_job_active_deadline(),
            influxdb_url: None,
            influxdb_database: default_influxdb_database(),
        };
        Ok((Arc::new(config), tmpdir))
    }
}

/// The pipelines config file, reloaded from disk every check cycle.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ConfigFile {
    /// Seconds between repository check cycles.
    pub check_frequency: u64,
    /// The configured pipelines, keyed by unique name.
    pub pipelines: HashMap<String, PipelineEntry>,
}

/// One pipeline entry of the config file.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct PipelineEntry {
    pub git_url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default)]
    pub docker_secret: Option<String>,
    #[serde(default)]
    pub env_from_secret: Option<String>,
}

fn default_branch() -> String {
    "master".to_string()
}

/// A named pipeline configuration, immutable per load cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    pub name: String,
    pub git_url: String,
    pub branch: String,
    pub docker_secret: Option<String>,
    pub env_from_secret: Option<String>,
}

impl ConfigFile {
    /// Load and parse the pipelines config file at the given path.
    pub async fn load(path: &str) -> Result<Self> {
        let content = tokio::fs::read(path).await.with_context(|| format!("error reading pipelines config file {}", path))?;
        serde_yaml::from_slice(&content).with_context(|| format!("error parsing pipelines config file {}", path))
    }

    /// Resolve the file's entries into named pipeline configs.
    pub fn pipeline_configs(&self) -> HashMap<String, PipelineConfig> {
        self.pipelines
            .iter()
            .map(|(name, entry)| {
                (
                    name.clone(),
                    PipelineConfig {
                        name: name.clone(),
                        git_url: entry.git_url.clone(),
                        branch: entry.branch.clone(),
                        docker_secret: entry.docker_secret.clone(),
                        env_from_secret: entry.env_from_secret.clone(),
                    },
                )
            })
            .collect()
    }
}
