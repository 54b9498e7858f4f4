//! Per-pipeline control-plane state.
//!
//! All long-lived loops and request handlers read and mutate pipeline state
//! through a single [`StateStore`], which guards the in-memory table and
//! snapshots it wholesale to the state database after state-mutating steps.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;
use crate::database::{Database, Tree};
use crate::executor::ClusterExecutor;
use crate::git::GitAccess;

/// Persisted state of one pipeline.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct PipelineState {
    /// The last commit accepted for a build of this pipeline.
    pub last_commit: Option<String>,
    /// Monotonically increasing counter of dispatched builds.
    pub iteration: u64,
    /// Unix timestamp of the last successful job submission.
    pub last_run_time: Option<i64>,
    /// The last revision check failed.
    pub check_error: bool,
    /// The spec at the current commit failed validation.
    pub config_error: bool,
    /// The last job submission failed.
    pub run_error: bool,
}

/// The guarded table of per-pipeline state, backed by the state database.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<Mutex<HashMap<String, PipelineState>>>,
    tree: Tree,
}

impl StateStore {
    /// Load all persisted pipeline state from the database.
    pub async fn load(db: &Database) -> Result<Self> {
        let tree = db.get_state_tree().await?;
        let scan_tree = tree.clone();
        let table = Database::spawn_blocking(move || -> Result<HashMap<String, PipelineState>> {
            let mut table = HashMap::new();
            for entry in scan_tree.iter() {
                let (key, val) = entry.context("error iterating persisted pipeline state")?;
                let name = String::from_utf8(key.to_vec()).context("invalid pipeline name in state database")?;
                let state: PipelineState = serde_json::from_slice(&val).context("error decoding persisted pipeline state")?;
                table.insert(name, state);
            }
            Ok(table)
        })
        .await??;

        tracing::info!(pipelines = table.len(), "loaded persisted pipeline state");
        Ok(Self {
            inner: Arc::new(Mutex::new(table)),
            tree,
        })
    }

    /// The current state of the named pipeline, if known.
    pub fn get(&self, name: &str) -> Option<PipelineState> {
        self.inner.lock().expect("state lock poisoned").get(name).cloned()
    }

    /// Ensure an entry exists for the named pipeline.
    pub fn ensure(&self, name: &str) {
        self.inner.lock().expect("state lock poisoned").entry(name.to_string()).or_default();
    }

    /// Mutate the named pipeline's state, creating a default entry as needed.
    pub fn update<F: FnOnce(&mut PipelineState)>(&self, name: &str, f: F) {
        let mut table = self.inner.lock().expect("state lock poisoned");
        f(table.entry(name.to_string()).or_default());
    }

    /// Evict state for any pipeline not present in the configured set,
    /// returning the evicted names. Evicted pipelines also vanish from the
    /// exported gauges, which are rendered from this table.
    pub fn evict_absent(&self, configured: &HashMap<String, PipelineConfig>) -> Vec<String> {
        let mut table = self.inner.lock().expect("state lock poisoned");
        let stale: Vec<String> = table.keys().filter(|name| !configured.contains_key(*name)).cloned().collect();
        for name in &stale {
            table.remove(name);
        }
        stale
    }

    /// Snapshot the full in-memory table to durable storage.
    pub async fn snapshot(&self) -> Result<()> {
        let table = self.inner.lock().expect("state lock poisoned").clone();
        let tree = self.tree.clone();
        Database::spawn_blocking(move || -> Result<()> {
            let mut batch = sled::Batch::default();
            for entry in tree.iter().keys() {
                let key = entry.context("error iterating persisted pipeline state")?;
                let name = String::from_utf8_lossy(&key).into_owned();
                if !table.contains_key(&name) {
                    batch.remove(key);
                }
            }
            for (name, state) in &table {
                let bytes = serde_json::to_vec(state).context("error encoding pipeline state")?;
                batch.insert(name.as_bytes(), bytes);
            }
            tree.apply_batch(batch).context("error applying state snapshot batch")?;
            tree.flush().context("error flushing state snapshot")?;
            Ok(())
        })
        .await??;
        Ok(())
    }

    /// Recover baselines at startup.
    ///
    /// For any configured pipeline whose persisted entry is absent or carries
    /// no last commit, the cluster's most recent job record is authoritative;
    /// failing that, the branch's current latest commit is adopted as the
    /// baseline without enqueuing a build for it.
    pub async fn recover(&self, pipelines: &HashMap<String, PipelineConfig>, git: &dyn GitAccess, executor: &dyn ClusterExecutor) {
        for (name, pipe) in pipelines {
            self.ensure(name);
            if self.get(name).and_then(|state| state.last_commit).is_some() {
                continue;
            }

            match executor.most_recent(name).await {
                Ok(Some(handle)) if handle.commit.is_some() => {
                    tracing::info!(pipeline = %name, job = %handle.name, "recovered pipeline baseline from most recent cluster job");
                    self.update(name, |state| {
                        state.last_commit = handle.commit.clone();
                        state.iteration = state.iteration.max(handle.iteration.unwrap_or(0));
                    });
                    continue;
                }
                Ok(_) => (),
                Err(err) => {
                    tracing::warn!(error = ?err, pipeline = %name, "error querying cluster for most recent job during recovery");
                }
            }

            match git.latest_commit(&pipe.git_url, &pipe.branch).await {
                Ok(commit) => {
                    tracing::info!(pipeline = %name, commit = %commit, "adopting current latest commit as baseline");
                    self.update(name, |state| state.last_commit = Some(commit.clone()));
                }
                Err(err) => {
                    tracing::warn!(error = ?err, pipeline = %name, "error resolving baseline commit during recovery");
                    self.update(name, |state| state.check_error = true);
                }
            }
        }
    }

    /// Render the per-pipeline health gauges in prometheus exposition format.
    ///
    /// Gauges are produced from the live table at scrape time, one sample per
    /// currently-configured pipeline, so entries removed on config reload
    /// disappear from the export immediately.
    pub fn render_gauges(&self) -> String {
        let table: BTreeMap<String, PipelineState> = self.inner.lock().expect("state lock poisoned").clone().into_iter().collect();

        let mut out = String::new();
        let bool_gauges: [(&str, &str, fn(&PipelineState) -> bool); 3] = [
            ("buildline_check_error", "the pipeline's last revision check failed", |s| s.check_error),
            ("buildline_config_error", "the pipeline's spec at the current commit failed validation", |s| s.config_error),
            ("buildline_run_error", "the pipeline's last job submission failed", |s| s.run_error),
        ];
        for (metric, help, getter) in bool_gauges {
            out.push_str(&format!("# HELP {} {}\n# TYPE {} gauge\n", metric, help, metric));
            for (name, state) in &table {
                out.push_str(&format!("{}{{pipeline=\"{}\"}} {}\n", metric, name, getter(state) as u8));
            }
        }

        out.push_str("# HELP buildline_iteration count of builds dispatched for the pipeline\n# TYPE buildline_iteration gauge\n");
        for (name, state) in &table {
            out.push_str(&format!("buildline_iteration{{pipeline=\"{}\"}} {}\n", name, state.iteration));
        }
        out.push_str("# HELP buildline_last_run_time unix timestamp of the pipeline's last dispatched build\n# TYPE buildline_last_run_time gauge\n");
        for (name, state) in &table {
            out.push_str(&format!("buildline_last_run_time{{pipeline=\"{}\"}} {}\n", name, state.last_run_time.unwrap_or(0)));
        }
        out
    }
}
