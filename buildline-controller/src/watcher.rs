//! Change detection over the configured pipelines.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::config::{Config, ConfigFile, PipelineConfig, PipelinesMap};
use crate::dispatcher::{BuildRequest, Commit};
use crate::error::GitError;
use crate::git::GitAccess;
use crate::prom::METRIC_CHECK_CYCLES;
use crate::state::StateStore;
use buildline_core::{PipelineSpec, SpecDocument, SpecError};

/// Memoization of `(pipeline, commit)` to a validated spec or its validation
/// failure, so a previously seen commit is never refetched or revalidated.
#[derive(Clone, Default)]
pub struct RevisionCache {
    inner: Arc<Mutex<HashMap<(String, String), Result<Arc<PipelineSpec>, Arc<SpecError>>>>>,
}

impl RevisionCache {
    pub fn get(&self, pipeline: &str, commit: &str) -> Option<Result<Arc<PipelineSpec>, Arc<SpecError>>> {
        self.inner
            .lock()
            .expect("revision cache lock poisoned")
            .get(&(pipeline.to_string(), commit.to_string()))
            .cloned()
    }

    pub fn put_spec(&self, pipeline: &str, commit: &str, spec: Arc<PipelineSpec>) {
        self.inner
            .lock()
            .expect("revision cache lock poisoned")
            .insert((pipeline.to_string(), commit.to_string()), Ok(spec));
    }

    pub fn put_error(&self, pipeline: &str, commit: &str, err: SpecError) {
        self.inner
            .lock()
            .expect("revision cache lock poisoned")
            .insert((pipeline.to_string(), commit.to_string()), Err(Arc::new(err)));
    }

    /// Drop all cached revisions of a pipeline.
    pub fn purge_pipeline(&self, pipeline: &str) {
        self.inner
            .lock()
            .expect("revision cache lock poisoned")
            .retain(|(name, _), _| name != pipeline);
    }
}

/// The per-pipeline polling loop.
///
/// Each cycle performs a full configuration reload, evicts state for
/// pipelines removed from config, and polls every configured pipeline
/// sequentially. Per-call git timeouts bound total cycle latency.
pub struct ChangeWatcher {
    config: Arc<Config>,
    pipelines: PipelinesMap,
    state: StateStore,
    cache: RevisionCache,
    git: Arc<dyn GitAccess>,
    queue_tx: mpsc::Sender<BuildRequest>,

    /// Seconds between check cycles, refreshed from the config file.
    check_frequency: Duration,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl ChangeWatcher {
    pub fn new(
        config: Arc<Config>, pipelines: PipelinesMap, state: StateStore, cache: RevisionCache, git: Arc<dyn GitAccess>, queue_tx: mpsc::Sender<BuildRequest>,
        check_frequency: Duration, shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            config,
            pipelines,
            state,
            cache,
            git,
            queue_tx,
            check_frequency,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::info!("change watcher initialized");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.check_frequency) => self.cycle().await,
                _ = self.shutdown_rx.next() => break,
            }
        }
        tracing::debug!("change watcher has shutdown");
        Ok(())
    }

    /// One full check cycle: reload config, evict stale state, poll each
    /// pipeline in turn, snapshot state.
    async fn cycle(&mut self) {
        self.reload_config().await;

        let current = self.pipelines.load_full();
        let mut names: Vec<&String> = current.keys().collect();
        names.sort();
        for name in names {
            if let Some(pipe) = current.get(name) {
                self.poll(pipe).await;
            }
        }

        metrics::increment_counter!(METRIC_CHECK_CYCLES);
        if let Err(err) = self.state.snapshot().await {
            tracing::error!(error = ?err, "error snapshotting pipeline state");
        }
    }

    /// Reload the pipelines config file, diff it against the previous view,
    /// and evict state for pipelines no longer configured. A reload failure
    /// keeps the previous view.
    async fn reload_config(&mut self) {
        let file = match ConfigFile::load(&self.config.pipelines_file).await {
            Ok(file) => file,
            Err(err) => {
                tracing::error!(error = ?err, "error reloading pipelines config file, keeping previous config");
                return;
            }
        };
        self.check_frequency = Duration::from_secs(file.check_frequency);

        let configs = file.pipeline_configs();
        for name in configs.keys() {
            self.state.ensure(name);
        }
        let evicted = self.state.evict_absent(&configs);
        for name in &evicted {
            tracing::info!(pipeline = %name, "pipeline removed from config, evicting state");
            self.cache.purge_pipeline(name);
        }
        self.pipelines.store(Arc::new(configs));
    }

    /// Poll one pipeline for a new revision, enqueuing a build request when a
    /// new commit with a valid spec is found.
    #[tracing::instrument(level = "debug", skip(self, pipe), fields(pipeline = %pipe.name))]
    async fn poll(&self, pipe: &PipelineConfig) {
        let commit = match self.git.latest_commit(&pipe.git_url, &pipe.branch).await {
            Ok(commit) => commit,
            Err(err) => {
                tracing::warn!(error = ?err, pipeline = %pipe.name, "error resolving latest commit");
                self.state.update(&pipe.name, |state| state.check_error = true);
                return;
            }
        };
        self.state.update(&pipe.name, |state| state.check_error = false);

        let unchanged = self.state.get(&pipe.name).and_then(|state| state.last_commit).as_deref() == Some(commit.as_str());
        if unchanged {
            return;
        }

        match self.cache.get(&pipe.name, &commit) {
            // Already validated: enqueue directly.
            Some(Ok(_)) => (),
            // Known-bad commit: already flagged, not retried until a newer commit appears.
            Some(Err(_)) => return,
            None => match load_spec(self.git.as_ref(), &self.cache, &self.state, &self.config, pipe, &commit).await {
                Some(_) => (),
                None => return,
            },
        }

        self.state.update(&pipe.name, |state| {
            state.config_error = false;
            state.last_commit = Some(commit.clone());
        });
        let request = BuildRequest {
            pipeline: pipe.name.clone(),
            commit: Commit::At(commit.clone()),
        };
        tracing::info!(pipeline = %pipe.name, commit = %commit, "new revision detected, enqueuing build");
        if let Err(err) = self.queue_tx.send(request).await {
            tracing::error!(error = ?err, pipeline = %pipe.name, "error enqueuing build request");
        }
    }
}

/// Fetch and validate a pipeline's spec at a commit, recording the outcome in
/// the revision cache and the pipeline's health flags. Returns the validated
/// spec, or `None` when the spec could not be obtained or did not validate.
pub(crate) async fn load_spec(
    git: &dyn GitAccess, cache: &RevisionCache, state: &StateStore, config: &Config, pipe: &PipelineConfig, commit: &str,
) -> Option<Arc<PipelineSpec>> {
    let content = match git.fetch_file(&pipe.git_url, commit, &config.spec_file).await {
        Ok(content) => content,
        Err(GitError::FileNotFound(path)) => {
            let err = SpecError::Schema(format!("spec file `{}` not found in repository", path));
            tracing::warn!(pipeline = %pipe.name, commit = %commit, error = %err, "pipeline spec missing at commit");
            cache.put_error(&pipe.name, commit, err);
            state.update(&pipe.name, |state| state.config_error = true);
            return None;
        }
        Err(err) => {
            // Transport-level failure: recoverable, retried next cycle.
            tracing::warn!(error = ?err, pipeline = %pipe.name, commit = %commit, "error fetching pipeline spec");
            state.update(&pipe.name, |state| state.check_error = true);
            return None;
        }
    };

    let validated = SpecDocument::parse(&content).and_then(|doc| doc.validate());
    match validated {
        Ok(spec) => {
            let spec = Arc::new(spec);
            cache.put_spec(&pipe.name, commit, spec.clone());
            state.update(&pipe.name, |state| state.config_error = false);
            Some(spec)
        }
        Err(err) => {
            tracing::warn!(pipeline = %pipe.name, commit = %commit, error = %err, "pipeline spec failed validation");
            cache.put_error(&pipe.name, commit, err);
            state.update(&pipe.name, |state| state.config_error = true);
            None
        }
    }
}

#[cfg(test)]
mod watcher_test;
