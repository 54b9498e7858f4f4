//! Repository access via the system git binary.

use std::path::PathBuf;
use std::process::Output;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

use crate::config::Config;
use crate::error::GitError;

/// Access to watched source repositories.
#[async_trait]
pub trait GitAccess: Send + Sync + 'static {
    /// Resolve the current commit of the given branch on the remote.
    async fn latest_commit(&self, url: &str, branch: &str) -> Result<String, GitError>;

    /// Fetch the content of a file at a specific commit.
    async fn fetch_file(&self, url: &str, commit: &str, path: &str) -> Result<Vec<u8>, GitError>;
}

/// A `GitAccess` implementation shelling out to the `git` binary.
///
/// Ref resolution uses `ls-remote` and never touches disk. File fetches keep
/// a cached bare clone per repository under the configured data dir. Every
/// invocation is bounded by the configured call timeout so one unresponsive
/// remote cannot stall a whole check cycle.
pub struct GitCli {
    data_dir: PathBuf,
    timeout: Duration,
}

impl GitCli {
    pub fn new(config: &Arc<Config>) -> Self {
        Self {
            data_dir: PathBuf::from(&config.git_data_path),
            timeout: Duration::from_secs(config.call_timeout_seconds),
        }
    }

    /// Run a git invocation with the configured timeout, capturing its output.
    async fn run(&self, args: &[&str]) -> Result<Output, GitError> {
        let fut = Command::new("git").args(args).kill_on_drop(true).output();
        let output = tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| GitError::Timeout(self.timeout))?
            .context("error invoking git")?;
        Ok(output)
    }

    /// The cache directory of a repository's bare clone.
    fn repo_dir(&self, url: &str) -> PathBuf {
        let sanitized: String = url.chars().map(|c| if c.is_ascii_alphanumeric() { c } else { '-' }).collect();
        self.data_dir.join(sanitized)
    }

    /// Ensure a bare clone of the repository exists and carries current refs.
    async fn ensure_repo(&self, url: &str) -> Result<PathBuf, GitError> {
        tokio::fs::create_dir_all(&self.data_dir)
            .await
            .context("error creating git data dir")?;
        let dir = self.repo_dir(url);
        let dir_str = dir.to_string_lossy().into_owned();
        if !dir.exists() {
            let output = self.run(&["clone", "--bare", url, &dir_str]).await?;
            if !output.status.success() {
                return Err(GitError::Other(anyhow!("error cloning {}: {}", url, String::from_utf8_lossy(&output.stderr).trim())));
            }
        } else {
            let output = self.run(&["-C", &dir_str, "fetch", "--prune", "origin", "+refs/heads/*:refs/heads/*"]).await?;
            if !output.status.success() {
                return Err(GitError::Other(anyhow!("error fetching {}: {}", url, String::from_utf8_lossy(&output.stderr).trim())));
            }
        }
        Ok(dir)
    }
}

#[async_trait]
impl GitAccess for GitCli {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn latest_commit(&self, url: &str, branch: &str) -> Result<String, GitError> {
        let refspec = format!("refs/heads/{}", branch);
        let output = self.run(&["ls-remote", url, &refspec]).await?;
        if !output.status.success() {
            return Err(GitError::Other(anyhow!(
                "error listing remote refs of {}: {}",
                url,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .split_whitespace()
            .next()
            .map(String::from)
            .filter(|sha| !sha.is_empty())
            .ok_or_else(|| GitError::BranchNotFound(branch.to_string()))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn fetch_file(&self, url: &str, commit: &str, path: &str) -> Result<Vec<u8>, GitError> {
        let dir = self.ensure_repo(url).await?;
        let dir_str = dir.to_string_lossy().into_owned();
        let object = format!("{}:{}", commit, path);
        let output = self.run(&["-C", &dir_str, "show", &object]).await?;
        if output.status.success() {
            return Ok(output.stdout);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("does not exist") || stderr.contains("exists on disk, but not in") {
            return Err(GitError::FileNotFound(path.to_string()));
        }
        Err(GitError::Other(anyhow!("error reading {} at {}: {}", path, commit, stderr.trim())))
    }
}
