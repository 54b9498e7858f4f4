//! The stage sequencer driving the ordered stage chain of one build job.
//!
//! Stage containers in the job share one directory with this process. Each
//! stage appends to its own log file there and signals completion by writing
//! a line whose prefix matches one of the configured sentinels; this process
//! tails each file in declared order with a bounded-delay poll loop.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;

use crate::config::Config;
use crate::telemetry::{MetricsSink, Point, MEASUREMENT_DURATION, MEASUREMENT_LOGS, MEASUREMENT_STATUS, STATUS_FAILED, STATUS_RUNNING, STATUS_SUCCEEDED};
use buildline_core::protocol;

/// Execution state of one stage.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StageState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// The record of one driven stage.
#[derive(Clone, Debug)]
pub struct StageRun {
    pub name: String,
    pub state: StageState,
    pub duration_secs: Option<u64>,
}

/// The final report of a driven job.
#[derive(Clone, Debug)]
pub struct JobOutcome {
    pub succeeded: bool,
    pub stages: Vec<StageRun>,
}

/// How a tailed stage ended.
enum TailEnd {
    Succeeded,
    Failed,
    TimedOut,
}

/// The in-job driver of the ordered stage chain.
pub struct StageSequencer {
    config: Arc<Config>,
    sink: Arc<dyn MetricsSink>,
}

impl StageSequencer {
    pub fn new(config: Arc<Config>, sink: Arc<dyn MetricsSink>) -> Self {
        Self { config, sink }
    }

    /// Drive the full stage chain to completion.
    pub async fn run(&self) -> Result<JobOutcome> {
        self.write_env_file().await?;

        let stages = self.config.stage_names();
        self.write_status(None, STATUS_RUNNING).await;
        for stage in &stages {
            self.sink.write(self.point(MEASUREMENT_LOGS, Some(stage.as_str())).field_str("value", "waiting")).await;
        }

        let deadline = self.config.time_limit_seconds.map(|secs| Instant::now() + Duration::from_secs(secs));
        let mut prior_success: Option<bool> = None;
        let mut runs = Vec::with_capacity(stages.len());
        for stage in &stages {
            let run = self.run_stage(stage, prior_success, deadline).await;
            prior_success = Some(run.state == StageState::Succeeded);
            runs.push(run);
        }

        let succeeded = !runs.is_empty() && runs.iter().all(|run| run.state == StageState::Succeeded);
        self.write_status(None, if succeeded { STATUS_SUCCEEDED } else { STATUS_FAILED }).await;
        Ok(JobOutcome { succeeded, stages: runs })
    }

    /// Write the env file into the shared dir, before any stage starts.
    async fn write_env_file(&self) -> Result<()> {
        let path = Path::new(&self.config.log_dir).join(protocol::ENV_FILE_NAME);
        let iteration = self.config.iteration.to_string();
        let body = protocol::render_env_file(vec![(protocol::ENV_ITERATION, iteration.as_str())]);
        tokio::fs::write(&path, body)
            .await
            .with_context(|| format!("error writing env file {}", path.display()))
    }

    /// Drive one stage to a terminal state.
    #[tracing::instrument(level = "debug", skip(self, prior_success, deadline))]
    async fn run_stage(&self, stage: &str, prior_success: Option<bool>, deadline: Option<Instant>) -> StageRun {
        let mut run = StageRun {
            name: stage.to_string(),
            state: StageState::Pending,
            duration_secs: None,
        };
        let path = Path::new(&self.config.log_dir).join(stage);

        // A prior failure cascades: the stage never runs, and its log file
        // gets the failure sentinel so its waiting container unblocks.
        if prior_success == Some(false) {
            tracing::info!(stage, "failing stage due to previous failure");
            if let Err(err) = tokio::fs::write(&path, format!("{}\n", self.config.failure_sentinel)).await {
                tracing::warn!(error = ?err, stage, "error writing failure sentinel to skipped stage log");
            }
            self.write_status(Some(stage), STATUS_FAILED).await;
            run.state = StageState::Failed;
            return run;
        }

        // Truncate/create the stage's log file. A failure here is a protocol
        // error, fatal to the stage.
        if let Err(err) = tokio::fs::File::create(&path).await {
            tracing::error!(error = ?err, stage, "error creating stage log file");
            self.write_status(Some(stage), STATUS_FAILED).await;
            run.state = StageState::Failed;
            return run;
        }

        run.state = StageState::Running;
        self.write_status(Some(stage), STATUS_RUNNING).await;
        self.sink
            .write(self.point(MEASUREMENT_LOGS, Some(stage)).field_str("value", &self.config.start_sentinel))
            .await;
        tracing::info!(stage, "stage started");
        let started = Instant::now();

        match self.tail(stage, &path, deadline).await {
            Ok(TailEnd::Succeeded) => {
                let duration = ceil_secs(started.elapsed());
                self.sink
                    .write(self.point(MEASUREMENT_DURATION, Some(stage)).field_int("value", duration as i64))
                    .await;
                self.write_status(Some(stage), STATUS_SUCCEEDED).await;
                tracing::info!(stage, duration, "stage succeeded");
                run.duration_secs = Some(duration);
                run.state = StageState::Succeeded;
            }
            Ok(TailEnd::Failed) => {
                self.write_status(Some(stage), STATUS_FAILED).await;
                tracing::error!(stage, "failure signaled in stage log");
                run.state = StageState::Failed;
            }
            Ok(TailEnd::TimedOut) => {
                self.write_status(Some(stage), STATUS_FAILED).await;
                tracing::error!(stage, "time limit elapsed while stage was running");
                run.state = StageState::Failed;
            }
            Err(err) => {
                self.write_status(Some(stage), STATUS_FAILED).await;
                tracing::error!(error = ?err, stage, "error tailing stage log file");
                run.state = StageState::Failed;
            }
        }
        run
    }

    /// Tail a stage's log file until a sentinel line appears or the deadline
    /// elapses, forwarding each complete non-empty line as a log point.
    /// Sentinels match on line prefix. Partial lines are carried across polls.
    async fn tail(&self, stage: &str, path: &Path, deadline: Option<Instant>) -> Result<TailEnd> {
        let mut file = tokio::fs::File::open(path).await.context("error opening stage log file")?;
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        let mut pending = String::new();
        loop {
            let mut chunk = String::new();
            file.read_to_string(&mut chunk).await.context("error reading stage log file")?;
            pending.push_str(&chunk);

            while let Some(idx) = pending.find('\n') {
                let line: String = pending.drain(..=idx).collect();
                let line = line.trim_end();
                if line.is_empty() {
                    continue;
                }
                self.sink.write(self.point(MEASUREMENT_LOGS, Some(stage)).field_str("value", line)).await;
                tracing::info!(stage, line, "stage log");
                if line.starts_with(&self.config.failure_sentinel) {
                    return Ok(TailEnd::Failed);
                }
                if line.starts_with(&self.config.success_sentinel) {
                    return Ok(TailEnd::Succeeded);
                }
            }

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Ok(TailEnd::TimedOut);
                }
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn write_status(&self, stage: Option<&str>, (value, code): (&str, i64)) {
        self.sink
            .write(self.point(MEASUREMENT_STATUS, stage).field_str("value", value).field_int("code", code))
            .await;
    }

    fn point(&self, measurement: &'static str, stage: Option<&str>) -> Point {
        let mut point = Point::new(measurement).tag("pipeline", &self.config.pipeline).tag("job", &self.config.job);
        if let Some(stage) = stage {
            point = point.tag("stage", stage);
        }
        point
    }
}

/// Wall-clock duration rounded up to whole seconds.
fn ceil_secs(elapsed: Duration) -> u64 {
    elapsed.as_secs() + u64::from(elapsed.subsec_nanos() > 0)
}

#[cfg(test)]
mod sequencer_test;
