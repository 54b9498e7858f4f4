use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::AsyncWriteExt;

use super::*;
use crate::config::Config;
use crate::telemetry::{FieldValue, RecordingSink};
use buildline_core::protocol;

/// Wait for the sequencer to create the stage's log file, then append lines.
async fn append_when_created(path: PathBuf, lines: Vec<String>) {
    while !path.exists() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    let mut file = tokio::fs::OpenOptions::new().append(true).open(&path).await.unwrap();
    for line in lines {
        file.write_all(format!("{}\n", line).as_bytes()).await.unwrap();
    }
}

fn harness(config: Config) -> (StageSequencer, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    (StageSequencer::new(Arc::new(config), sink.clone()), sink)
}

fn job_status_values(sink: &RecordingSink) -> Vec<String> {
    status_values(sink, None)
}

fn stage_status_values(sink: &RecordingSink, stage: &str) -> Vec<String> {
    status_values(sink, Some(stage))
}

fn status_values(sink: &RecordingSink, stage: Option<&str>) -> Vec<String> {
    sink.points
        .lock()
        .unwrap()
        .iter()
        .filter(|point| {
            let stage_tag = point.tags.iter().find(|(key, _)| key == "stage").map(|(_, val)| val.as_str());
            point.measurement == MEASUREMENT_STATUS && stage_tag == stage
        })
        .filter_map(|point| {
            point.fields.iter().find_map(|(key, value)| match value {
                FieldValue::String(val) if key == "value" => Some(val.clone()),
                _ => None,
            })
        })
        .collect()
}

#[tokio::test]
async fn stage_succeeds_on_success_sentinel_prefix() -> Result<()> {
    let tmpdir = tempfile::tempdir()?;
    let (sequencer, sink) = harness(Config::new_test(tmpdir.path(), "build"));
    let writer = tokio::spawn(append_when_created(
        tmpdir.path().join("build"),
        vec!["step one".to_string(), format!("{} all done", protocol::DEFAULT_SUCCESS_SENTINEL)],
    ));

    let outcome = sequencer.run().await?;
    writer.await?;

    assert!(outcome.succeeded);
    assert_eq!(outcome.stages.len(), 1);
    assert_eq!(outcome.stages[0].state, StageState::Succeeded);
    assert!(outcome.stages[0].duration_secs.is_some());

    let points = sink.points.lock().unwrap();
    assert!(
        points
            .iter()
            .any(|point| point.measurement == MEASUREMENT_LOGS
                && point.fields.contains(&("value".to_string(), FieldValue::String("step one".to_string())))),
        "each complete log line must be forwarded as a log point"
    );
    assert!(
        points
            .iter()
            .any(|point| point.measurement == MEASUREMENT_LOGS
                && point.fields.contains(&("value".to_string(), FieldValue::String(protocol::DEFAULT_START_SENTINEL.to_string())))),
        "a started stage must announce itself with the start sentinel"
    );
    assert!(points.iter().any(|point| point.measurement == MEASUREMENT_DURATION));
    drop(points);
    assert_eq!(job_status_values(&sink), vec!["running", "succeeded"]);
    Ok(())
}

#[tokio::test]
async fn env_file_is_written_before_any_stage_starts() -> Result<()> {
    let tmpdir = tempfile::tempdir()?;
    let (sequencer, _sink) = harness(Config::new_test(tmpdir.path(), "build"));
    let log_path = tmpdir.path().join("build");
    let env_path = tmpdir.path().join(protocol::ENV_FILE_NAME);

    let writer = tokio::spawn(async move {
        while !log_path.exists() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let env_present = env_path.exists();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut file = tokio::fs::OpenOptions::new().append(true).open(&log_path).await.unwrap();
        file.write_all(format!("{}\n", protocol::DEFAULT_SUCCESS_SENTINEL).as_bytes()).await.unwrap();
        env_present
    });

    let outcome = sequencer.run().await?;
    assert!(writer.await?, "the env file must exist before the first stage log is provisioned");
    assert!(outcome.succeeded);

    let body = std::fs::read_to_string(tmpdir.path().join(protocol::ENV_FILE_NAME))?;
    assert_eq!(body, "export BUILDLINE_ITERATION=7\n");
    Ok(())
}

#[tokio::test]
async fn failure_sentinel_fails_stage_and_cascades() -> Result<()> {
    let tmpdir = tempfile::tempdir()?;
    let (sequencer, sink) = harness(Config::new_test(tmpdir.path(), "build,push,deploy"));
    let writer = tokio::spawn(append_when_created(
        tmpdir.path().join("build"),
        vec!["no space left on device".to_string(), protocol::DEFAULT_FAILURE_SENTINEL.to_string()],
    ));

    let outcome = sequencer.run().await?;
    writer.await?;

    assert!(!outcome.succeeded);
    assert_eq!(outcome.stages[0].state, StageState::Failed);
    assert_eq!(outcome.stages[1].state, StageState::Failed);
    assert_eq!(outcome.stages[2].state, StageState::Failed);

    // Skipped stages never run; their logs carry the failure sentinel so any
    // waiting containers unblock.
    for skipped in ["push", "deploy"] {
        let log = std::fs::read_to_string(tmpdir.path().join(skipped))?;
        assert_eq!(log, format!("{}\n", protocol::DEFAULT_FAILURE_SENTINEL));
        assert_eq!(stage_status_values(&sink, skipped), vec!["failed"]);
    }
    assert_eq!(job_status_values(&sink), vec!["running", "failed"]);
    Ok(())
}

#[tokio::test]
async fn stages_run_in_declared_order_and_all_record_durations() -> Result<()> {
    let tmpdir = tempfile::tempdir()?;
    let (sequencer, sink) = harness(Config::new_test(tmpdir.path(), "zeta,alpha,mid"));
    let writers: Vec<_> = ["zeta", "alpha", "mid"]
        .into_iter()
        .map(|stage| {
            tokio::spawn(append_when_created(
                tmpdir.path().join(stage),
                vec![protocol::DEFAULT_SUCCESS_SENTINEL.to_string()],
            ))
        })
        .collect();

    let outcome = sequencer.run().await?;
    for writer in writers {
        writer.await?;
    }

    assert!(outcome.succeeded);
    let names: Vec<&str> = outcome.stages.iter().map(|run| run.name.as_str()).collect();
    assert_eq!(names, vec!["zeta", "alpha", "mid"], "declared order is execution order, never sorted");
    assert!(outcome.stages.iter().all(|run| run.duration_secs.is_some()));
    let durations = sink
        .points
        .lock()
        .unwrap()
        .iter()
        .filter(|point| point.measurement == MEASUREMENT_DURATION)
        .count();
    assert_eq!(durations, 3);
    Ok(())
}

#[tokio::test]
async fn time_limit_fails_the_running_stage() -> Result<()> {
    let tmpdir = tempfile::tempdir()?;
    let mut config = Config::new_test(tmpdir.path(), "build");
    config.time_limit_seconds = Some(0);
    let (sequencer, sink) = harness(config);

    let outcome = sequencer.run().await?;

    assert!(!outcome.succeeded);
    assert_eq!(outcome.stages[0].state, StageState::Failed);
    assert!(outcome.stages[0].duration_secs.is_none());
    assert_eq!(job_status_values(&sink), vec!["running", "failed"]);
    Ok(())
}

#[tokio::test]
async fn unwritable_stage_log_is_a_stage_failure() -> Result<()> {
    let tmpdir = tempfile::tempdir()?;
    // A directory squatting on the stage's log path makes create fail.
    std::fs::create_dir(tmpdir.path().join("build"))?;
    let (sequencer, sink) = harness(Config::new_test(tmpdir.path(), "build"));

    let outcome = sequencer.run().await?;

    assert!(!outcome.succeeded);
    assert_eq!(outcome.stages[0].state, StageState::Failed);
    assert_eq!(job_status_values(&sink), vec!["running", "failed"]);
    Ok(())
}

#[test]
fn durations_round_up_to_whole_seconds() {
    assert_eq!(ceil_secs(Duration::from_millis(1)), 1);
    assert_eq!(ceil_secs(Duration::from_millis(999)), 1);
    assert_eq!(ceil_secs(Duration::from_secs(2)), 2);
    assert_eq!(ceil_secs(Duration::from_millis(2001)), 3);
}
