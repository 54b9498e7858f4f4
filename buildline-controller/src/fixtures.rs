//! Shared test fixtures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::config::{Config, PipelineConfig, PipelinesMap};
use crate::database::Database;
use crate::error::GitError;
use crate::executor::{BuildSpec, ClusterExecutor, JobHandle};
use crate::git::GitAccess;
use crate::state::StateStore;

/// A valid two-stage pipeline spec.
pub const SPEC_OK: &str = r#"
stages:
  - name: build
    type: docker-build
  - name: push
    type: docker-push
    from_stage: build
    repo: org/app
    tags:
      - latest
"#;

/// A spec which parses but fails validation.
pub const SPEC_BAD: &str = "stages: []";

pub fn pipeline_config(name: &str) -> PipelineConfig {
    PipelineConfig {
        name: name.to_string(),
        git_url: format!("https://git.example.com/{}.git", name),
        branch: "master".to_string(),
        docker_secret: None,
        env_from_secret: None,
    }
}

pub fn pipelines_map(configs: Vec<PipelineConfig>) -> PipelinesMap {
    let map: HashMap<String, PipelineConfig> = configs.into_iter().map(|pipe| (pipe.name.clone(), pipe)).collect();
    Arc::new(arc_swap::ArcSwap::from_pointee(map))
}

/// A fresh state store over a temp-dir backed database.
pub async fn state_store(config: &Arc<Config>) -> Result<StateStore> {
    let db = Database::new(config.clone()).await?;
    StateStore::load(&db).await
}

/// An in-memory `GitAccess` stand-in.
#[derive(Default)]
pub struct MockGit {
    /// `(url, branch)` to commit sha.
    commits: Mutex<HashMap<(String, String), String>>,
    /// `(commit, path)` to file content.
    files: Mutex<HashMap<(String, String), Vec<u8>>>,
    /// When set, ref resolution fails with a transport error.
    pub fail_commits: AtomicBool,
    /// Count of file fetch calls observed.
    pub fetch_calls: AtomicUsize,
}

impl MockGit {
    pub fn set_commit(&self, url: &str, branch: &str, sha: &str) {
        self.commits
            .lock()
            .unwrap()
            .insert((url.to_string(), branch.to_string()), sha.to_string());
    }

    pub fn set_file(&self, commit: &str, path: &str, content: &str) {
        self.files
            .lock()
            .unwrap()
            .insert((commit.to_string(), path.to_string()), content.as_bytes().to_vec());
    }
}

#[async_trait]
impl GitAccess for MockGit {
    async fn latest_commit(&self, url: &str, branch: &str) -> Result<String, GitError> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(GitError::Other(anyhow::anyhow!("remote unavailable")));
        }
        self.commits
            .lock()
            .unwrap()
            .get(&(url.to_string(), branch.to_string()))
            .cloned()
            .ok_or_else(|| GitError::BranchNotFound(branch.to_string()))
    }

    async fn fetch_file(&self, _url: &str, commit: &str, path: &str) -> Result<Vec<u8>, GitError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.files
            .lock()
            .unwrap()
            .get(&(commit.to_string(), path.to_string()))
            .cloned()
            .ok_or_else(|| GitError::FileNotFound(path.to_string()))
    }
}

/// An in-memory `ClusterExecutor` stand-in.
#[derive(Default)]
pub struct MockExecutor {
    /// All successfully submitted builds, in submission order.
    pub submitted: Mutex<Vec<BuildSpec>>,
    /// When set, submissions fail.
    pub fail_submit: AtomicBool,
    /// Pipeline name to its most recent job record.
    pub recent: Mutex<HashMap<String, JobHandle>>,
}

#[async_trait]
impl ClusterExecutor for MockExecutor {
    async fn submit(&self, build: &BuildSpec) -> Result<JobHandle> {
        if self.fail_submit.load(Ordering::SeqCst) {
            bail!("cluster rejected job");
        }
        self.submitted.lock().unwrap().push(build.clone());
        Ok(JobHandle {
            name: format!("{}-{}", build.pipeline, build.iteration),
            commit: Some(build.commit.clone()),
            iteration: Some(build.iteration),
            active: true,
        })
    }

    async fn most_recent(&self, pipeline: &str) -> Result<Option<JobHandle>> {
        Ok(self.recent.lock().unwrap().get(pipeline).cloned())
    }
}
