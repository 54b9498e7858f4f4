//! The in-job stage sequencer.

mod config;
mod sequencer;
mod telemetry;

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::prelude::*;

use crate::config::Config;
use crate::sequencer::StageSequencer;
use crate::telemetry::{InfluxSink, MetricsSink, NoopSink};

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var.
        .with(tracing_subscriber::EnvFilter::from_default_env())
        // Send a copy of all spans to stdout in compact form.
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(true)
        )
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let config = Arc::new(Config::new()?);
    let sink: Arc<dyn MetricsSink> = match &config.influxdb_url {
        Some(url) => Arc::new(InfluxSink::new(url, &config.influxdb_database)),
        None => Arc::new(NoopSink),
    };

    tracing::info!(
        pipeline = %config.pipeline,
        job = %config.job,
        stages = ?config.stage_names(),
        "starting stage sequencer",
    );
    let outcome = StageSequencer::new(config, sink).run().await?;
    if outcome.succeeded {
        tracing::info!("job completed successfully");
    } else {
        tracing::error!("job ended with failure");
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    if !outcome.succeeded {
        std::process::exit(1);
    }
    Ok(())
}
