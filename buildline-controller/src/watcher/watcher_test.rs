use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc};

use super::*;
use crate::config::Config;
use crate::dispatcher::{BuildRequest, Commit};
use crate::fixtures::{self, pipeline_config, MockGit, SPEC_BAD, SPEC_OK};

const SHA: &str = "0f1e2d3c4b5a69788796a5b4c3d2e1f00f1e2d3c";
const SHA2: &str = "aabbccddeeff00112233445566778899aabbccdd";

struct Harness {
    watcher: ChangeWatcher,
    config: Arc<Config>,
    pipelines: PipelinesMap,
    state: StateStore,
    cache: RevisionCache,
    git: Arc<MockGit>,
    queue_rx: mpsc::Receiver<BuildRequest>,
    _tmpdir: tempfile::TempDir,
}

async fn harness(configs: Vec<PipelineConfig>) -> Result<Harness> {
    let (config, tmpdir) = Config::new_test()?;
    let state = fixtures::state_store(&config).await?;
    let cache = RevisionCache::default();
    let git = Arc::new(MockGit::default());
    let pipelines = fixtures::pipelines_map(configs);
    let (queue_tx, queue_rx) = mpsc::channel(16);
    let (shutdown_tx, _) = broadcast::channel(8);
    let watcher = ChangeWatcher::new(
        config.clone(),
        pipelines.clone(),
        state.clone(),
        cache.clone(),
        git.clone(),
        queue_tx,
        Duration::from_secs(60),
        shutdown_tx,
    );
    Ok(Harness {
        watcher,
        config,
        pipelines,
        state,
        cache,
        git,
        queue_rx,
        _tmpdir: tmpdir,
    })
}

#[tokio::test]
async fn poll_enqueues_build_for_new_commit() -> Result<()> {
    let pipe = pipeline_config("api");
    let mut h = harness(vec![pipe.clone()]).await?;
    h.git.set_commit(&pipe.git_url, &pipe.branch, SHA);
    h.git.set_file(SHA, &h.config.spec_file, SPEC_OK);

    h.watcher.poll(&pipe).await;

    let request = h.queue_rx.try_recv()?;
    assert_eq!(
        request,
        BuildRequest {
            pipeline: "api".to_string(),
            commit: Commit::At(SHA.to_string()),
        }
    );
    let state = h.state.get("api").unwrap();
    assert_eq!(state.last_commit.as_deref(), Some(SHA));
    assert!(!state.check_error);
    assert!(!state.config_error);
    Ok(())
}

#[tokio::test]
async fn poll_skips_unchanged_commit() -> Result<()> {
    let pipe = pipeline_config("api");
    let mut h = harness(vec![pipe.clone()]).await?;
    h.git.set_commit(&pipe.git_url, &pipe.branch, SHA);
    h.state.update("api", |state| {
        state.last_commit = Some(SHA.to_string());
        state.iteration = 2;
    });

    h.watcher.poll(&pipe).await;

    assert!(h.queue_rx.try_recv().is_err(), "unchanged commit must not enqueue a build");
    assert_eq!(h.git.fetch_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.state.get("api").unwrap().iteration, 2);
    Ok(())
}

#[tokio::test]
async fn poll_flags_invalid_spec_and_caches_the_failure() -> Result<()> {
    let pipe = pipeline_config("api");
    let mut h = harness(vec![pipe.clone()]).await?;
    h.git.set_commit(&pipe.git_url, &pipe.branch, SHA);
    h.git.set_file(SHA, &h.config.spec_file, SPEC_BAD);

    h.watcher.poll(&pipe).await;
    h.watcher.poll(&pipe).await;

    assert!(h.queue_rx.try_recv().is_err());
    let state = h.state.get("api").unwrap();
    assert!(state.config_error);
    assert!(state.last_commit.is_none(), "a commit with an invalid spec must not become the baseline");
    // The bad commit is cached and not revalidated on the second poll.
    assert_eq!(h.git.fetch_calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn poll_recovers_after_new_valid_commit() -> Result<()> {
    let pipe = pipeline_config("api");
    let mut h = harness(vec![pipe.clone()]).await?;
    h.git.set_commit(&pipe.git_url, &pipe.branch, SHA);
    h.git.set_file(SHA, &h.config.spec_file, SPEC_BAD);
    h.watcher.poll(&pipe).await;
    assert!(h.state.get("api").unwrap().config_error);

    h.git.set_commit(&pipe.git_url, &pipe.branch, SHA2);
    h.git.set_file(SHA2, &h.config.spec_file, SPEC_OK);
    h.watcher.poll(&pipe).await;

    let request = h.queue_rx.try_recv()?;
    assert_eq!(request.commit, Commit::At(SHA2.to_string()));
    let state = h.state.get("api").unwrap();
    assert!(!state.config_error);
    assert_eq!(state.last_commit.as_deref(), Some(SHA2));
    Ok(())
}

#[tokio::test]
async fn poll_missing_spec_file_is_a_config_error() -> Result<()> {
    let pipe = pipeline_config("api");
    let mut h = harness(vec![pipe.clone()]).await?;
    h.git.set_commit(&pipe.git_url, &pipe.branch, SHA);

    h.watcher.poll(&pipe).await;

    assert!(h.queue_rx.try_recv().is_err());
    let state = h.state.get("api").unwrap();
    assert!(state.config_error);
    assert!(!state.check_error);
    Ok(())
}

#[tokio::test]
async fn poll_transport_failure_sets_and_clears_check_error() -> Result<()> {
    let pipe = pipeline_config("api");
    let mut h = harness(vec![pipe.clone()]).await?;
    h.git.fail_commits.store(true, Ordering::SeqCst);

    h.watcher.poll(&pipe).await;
    assert!(h.state.get("api").unwrap().check_error);
    assert!(h.queue_rx.try_recv().is_err());

    h.git.fail_commits.store(false, Ordering::SeqCst);
    h.git.set_commit(&pipe.git_url, &pipe.branch, SHA);
    h.git.set_file(SHA, &h.config.spec_file, SPEC_OK);
    h.watcher.poll(&pipe).await;

    assert!(!h.state.get("api").unwrap().check_error);
    assert!(h.queue_rx.try_recv().is_ok());
    Ok(())
}

#[tokio::test]
async fn reload_config_evicts_removed_pipelines() -> Result<()> {
    let mut h = harness(vec![pipeline_config("api"), pipeline_config("legacy")]).await?;
    h.state.ensure("legacy");
    h.cache.put_error("legacy", SHA, buildline_core::SpecError::NoStages);
    std::fs::write(
        &h.config.pipelines_file,
        "check_frequency: 30\npipelines:\n  api:\n    git_url: https://git.example.com/api.git\n",
    )?;

    h.watcher.reload_config().await;

    let current = h.pipelines.load();
    assert!(current.contains_key("api"));
    assert!(!current.contains_key("legacy"));
    assert!(h.state.get("api").is_some());
    assert!(h.state.get("legacy").is_none());
    assert!(h.cache.get("legacy", SHA).is_none());
    assert_eq!(h.watcher.check_frequency, Duration::from_secs(30));
    Ok(())
}

#[tokio::test]
async fn reload_config_failure_keeps_previous_view() -> Result<()> {
    let mut h = harness(vec![pipeline_config("api")]).await?;
    h.state.ensure("api");

    // The pipelines file was never written in this harness.
    h.watcher.reload_config().await;

    assert!(h.pipelines.load().contains_key("api"));
    assert!(h.state.get("api").is_some());
    Ok(())
}
