//! The contract shared between the control plane and the in-job stage chain.
//!
//! A dispatched build job mounts one shared directory. The sequencer writes an
//! env file into it before any stage starts, and each stage container appends
//! to its own log file in that directory. Stage completion is signaled by
//! writing a line whose prefix matches one of the configured sentinel strings;
//! the sequencer tails each file with a bounded-delay poll loop, so stage
//! containers never need to call back to the control plane.

/// The name of the env file written into the shared job directory.
pub const ENV_FILE_NAME: &str = "buildline.env";

/// Default line prefix signaling that a stage has started.
pub const DEFAULT_START_SENTINEL: &str = "BUILDLINE_STAGE_STARTING";
/// Default line prefix signaling successful stage completion.
pub const DEFAULT_SUCCESS_SENTINEL: &str = "BUILDLINE_STAGE_SUCCESS";
/// Default line prefix signaling stage failure.
pub const DEFAULT_FAILURE_SENTINEL: &str = "BUILDLINE_STAGE_FAILURE";

/// Default path of the pipeline spec file within a watched repository.
pub const DEFAULT_SPEC_FILE: &str = "buildline.yml";

// Env var names exported to stage containers.
pub const ENV_GIT_URL: &str = "BUILDLINE_GIT_URL";
pub const ENV_COMMIT_SHA: &str = "BUILDLINE_COMMIT_SHA";
pub const ENV_COMMIT_SHA_SHORT: &str = "BUILDLINE_COMMIT_SHA_SHORT";
pub const ENV_ITERATION: &str = "BUILDLINE_ITERATION";
pub const ENV_STAGE_NAME: &str = "BUILDLINE_STAGE_NAME";
pub const ENV_STAGE_NUMBER: &str = "BUILDLINE_STAGE_NUMBER";
pub const ENV_BUILD_DIR: &str = "BUILDLINE_BUILD_DIR";
pub const ENV_DOCKERFILE: &str = "BUILDLINE_DOCKERFILE";
pub const ENV_COMMANDS: &str = "BUILDLINE_COMMANDS";
pub const ENV_DOCKER_PUSH_TAGS: &str = "BUILDLINE_DOCKER_PUSH_TAGS";

/// Render a set of key/value pairs as an `export KEY=VALUE` env file body.
pub fn render_env_file<'a, I>(entries: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut buf = String::new();
    for (key, val) in entries {
        buf.push_str("export ");
        buf.push_str(key);
        buf.push('=');
        buf.push_str(val);
        buf.push('\n');
    }
    buf
}

/// Shorten a commit sha for labels and env vars.
pub fn short_sha(sha: &str) -> &str {
    if sha.len() > 6 {
        &sha[..6]
    } else {
        sha
    }
}
