//! Control-plane error abstractions.

use std::time::Duration;

/// Errors from resolving refs or fetching files out of a watched repository.
///
/// Everything but `FileNotFound` is recoverable: the watcher flags the
/// pipeline and retries on the next poll cycle.
#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("file `{0}` not found at requested revision")]
    FileNotFound(String),
    #[error("branch `{0}` not found on remote")]
    BranchNotFound(String),
    #[error("git call timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Rejections of a manual build trigger. None of these mutate queue or state.
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("pipeline `{0}` is not configured")]
    NotFound(String),
    #[error("pipeline `{0}` is unhealthy, its last revision check failed")]
    Unhealthy(String),
    #[error("internal error enqueuing build: {0}")]
    Internal(String),
}
