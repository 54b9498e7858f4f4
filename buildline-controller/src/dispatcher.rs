//! The build backlog and its dispatch loop.
//!
//! The backlog is a bounded mpsc channel: requests are dispatched strictly in
//! the order they were enqueued (FIFO), an explicit fairness decision so that
//! a busy pipeline cannot starve the others.

use std::sync::Arc;

use anyhow::Result;
use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::config::{Config, PipelineConfig, PipelinesMap};
use crate::executor::{BuildSpec, ClusterExecutor};
use crate::git::GitAccess;
use crate::prom::{METRIC_BUILDS_SUBMITTED, METRIC_SUBMISSION_ERRORS};
use crate::state::StateStore;
use crate::watcher::{load_spec, RevisionCache};
use buildline_core::PipelineSpec;

/// The commit a build request targets.
#[derive(Clone, Debug, PartialEq)]
pub enum Commit {
    /// Resolve the pipeline branch's current commit at dispatch time.
    Latest,
    /// Build a specific commit.
    At(String),
}

/// A request to build a pipeline, consumed at most once by the dispatcher.
#[derive(Clone, Debug, PartialEq)]
pub struct BuildRequest {
    pub pipeline: String,
    pub commit: Commit,
}

/// The dispatch loop draining the build backlog.
pub struct Dispatcher {
    config: Arc<Config>,
    pipelines: PipelinesMap,
    state: StateStore,
    cache: RevisionCache,
    git: Arc<dyn GitAccess>,
    executor: Arc<dyn ClusterExecutor>,

    /// The build backlog.
    queue_rx: mpsc::Receiver<BuildRequest>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>, pipelines: PipelinesMap, state: StateStore, cache: RevisionCache, git: Arc<dyn GitAccess>, executor: Arc<dyn ClusterExecutor>,
        queue_rx: mpsc::Receiver<BuildRequest>, shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            config,
            pipelines,
            state,
            cache,
            git,
            executor,
            queue_rx,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::info!("build dispatcher initialized");
        loop {
            tokio::select! {
                request_opt = self.queue_rx.recv() => match request_opt {
                    Some(request) => {
                        self.handle_request(request).await;
                        if let Err(err) = self.state.snapshot().await {
                            tracing::error!(error = ?err, "error snapshotting pipeline state");
                        }
                    }
                    None => break,
                },
                _ = self.shutdown_rx.next() => break,
            }
        }
        tracing::debug!("build dispatcher has shutdown");
        Ok(())
    }

    /// Dispatch one dequeued build request. A failed submission is dropped
    /// without retry: a later detected change or another manual trigger is
    /// the only retry path.
    #[tracing::instrument(level = "debug", skip(self, request), fields(pipeline = %request.pipeline))]
    async fn handle_request(&self, request: BuildRequest) {
        let pipe = match self.pipelines.load().get(&request.pipeline).cloned() {
            Some(pipe) => pipe,
            None => {
                tracing::warn!(pipeline = %request.pipeline, "dropping build request for pipeline no longer configured");
                return;
            }
        };

        let resolved_latest = matches!(request.commit, Commit::Latest);
        let commit = match request.commit {
            Commit::At(sha) => sha,
            Commit::Latest => match self.git.latest_commit(&pipe.git_url, &pipe.branch).await {
                Ok(commit) => commit,
                Err(err) => {
                    tracing::warn!(error = ?err, pipeline = %pipe.name, "error resolving latest commit for build request");
                    self.state.update(&pipe.name, |state| state.check_error = true);
                    return;
                }
            },
        };

        let spec = match self.resolve_spec(&pipe, &commit).await {
            Some(spec) => spec,
            None => return,
        };

        // Single-flight: skip submission while the cluster reports an active
        // job for this pipeline. Same retry path as a submission failure.
        match self.executor.most_recent(&pipe.name).await {
            Ok(Some(handle)) if handle.active => {
                tracing::warn!(pipeline = %pipe.name, job = %handle.name, "active job already running, dropping build request");
                return;
            }
            Ok(_) => (),
            Err(err) => {
                tracing::warn!(error = ?err, pipeline = %pipe.name, "error checking for active jobs, proceeding with submission");
            }
        }

        let iteration = self.state.get(&pipe.name).map(|state| state.iteration).unwrap_or(0) + 1;
        let build = BuildSpec {
            pipeline: pipe.name.clone(),
            git_url: pipe.git_url.clone(),
            commit: commit.clone(),
            iteration,
            docker_secret: pipe.docker_secret.clone(),
            env_from_secret: pipe.env_from_secret.clone(),
            spec,
        };

        match self.executor.submit(&build).await {
            Ok(handle) => {
                let now = time::OffsetDateTime::now_utc().unix_timestamp();
                self.state.update(&pipe.name, |state| {
                    state.iteration = state.iteration.max(iteration);
                    state.last_run_time = Some(now);
                    // Only a branch-tip build moves the watcher's change
                    // detection baseline. A pinned-commit build may target an
                    // older commit; advancing the baseline to it would make
                    // the unchanged tip look new on the next poll.
                    if resolved_latest {
                        state.last_commit = Some(commit.clone());
                    }
                    state.run_error = false;
                });
                metrics::increment_counter!(METRIC_BUILDS_SUBMITTED, "pipeline" => pipe.name.clone());
                tracing::info!(pipeline = %pipe.name, commit = %commit, iteration, job = %handle.name, "successfully triggered build");
            }
            Err(err) => {
                self.state.update(&pipe.name, |state| state.run_error = true);
                metrics::increment_counter!(METRIC_SUBMISSION_ERRORS, "pipeline" => pipe.name.clone());
                tracing::error!(error = ?err, pipeline = %pipe.name, commit = %commit, "error submitting build job");
            }
        }
    }

    /// Reuse the cached validated spec for the commit, or fetch + validate
    /// inline on a cache miss.
    async fn resolve_spec(&self, pipe: &PipelineConfig, commit: &str) -> Option<Arc<PipelineSpec>> {
        match self.cache.get(&pipe.name, commit) {
            Some(Ok(spec)) => Some(spec),
            Some(Err(err)) => {
                tracing::warn!(pipeline = %pipe.name, commit = %commit, error = %err, "dropping build request for commit with invalid spec");
                None
            }
            None => load_spec(self.git.as_ref(), &self.cache, &self.state, &self.config, pipe, commit).await,
        }
    }
}
