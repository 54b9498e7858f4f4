//! The HTTP server: manual build triggers, health & metrics.

use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Extension, Path, Query};
use axum::http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode};
use axum::routing::{get, post};
use axum::{AddExtensionLayer, Json, Router};
use futures::prelude::*;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::config::{Config, PipelinesMap};
use crate::dispatcher::{BuildRequest, Commit};
use crate::error::TriggerError;
use crate::prom::get_metrics_recorder;
use crate::state::StateStore;

/// Shared context of the trigger & metrics handlers.
pub struct TriggerCtx {
    /// The currently configured pipelines.
    pub pipelines: PipelinesMap,
    /// The per-pipeline state table.
    pub state: StateStore,
    /// The sending side of the build backlog.
    pub queue_tx: mpsc::Sender<BuildRequest>,
}

/// Query parameters of a manual build trigger.
#[derive(Debug, Default, Deserialize)]
pub struct TriggerParams {
    /// An explicit commit to build; omitted means the branch's latest.
    #[serde(default)]
    pub commit: Option<String>,
}

/// Response body of a manual build trigger.
#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub pipeline: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    pub enqueued: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Spawn the HTTP server, serving triggers, health & prometheus scrapes.
pub fn spawn_server(config: &Arc<Config>, ctx: Arc<TriggerCtx>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<Result<()>> {
    let handle = get_metrics_recorder(config).handle();
    let app = Router::new()
        .route("/health", get(|| async { StatusCode::OK }))
        .route("/metrics", get(metrics_scrape))
        .route("/build/:pipeline", post(trigger_build))
        .layer(AddExtensionLayer::new(handle))
        .layer(AddExtensionLayer::new(ctx));
    let server = axum::Server::bind(&([0, 0, 0, 0], config.http_port).into())
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move {
            let _res = shutdown.recv().await;
        });
    tracing::info!("HTTP server is listening at 0.0.0.0:{}", config.http_port);
    tokio::spawn(server.map_err(anyhow::Error::from))
}

/// Handle prometheus metrics scraping, appending the per-pipeline health
/// gauges rendered from the live state table.
async fn metrics_scrape(Extension(handle): Extension<PrometheusHandle>, Extension(ctx): Extension<Arc<TriggerCtx>>) -> (StatusCode, HeaderMap, String) {
    let mut headers = HeaderMap::new();
    headers.insert(HeaderName::from_static("content-type"), HeaderValue::from_static("text/plain; version=0.0.4"));
    let mut body = handle.render();
    body.push_str(&ctx.state.render_gauges());
    (StatusCode::OK, headers, body)
}

/// Handle a manual build trigger.
#[tracing::instrument(level = "debug", skip(ctx, params))]
async fn trigger_build(
    Path(pipeline): Path<String>, params: Option<Query<TriggerParams>>, Extension(ctx): Extension<Arc<TriggerCtx>>,
) -> (StatusCode, Json<TriggerResponse>) {
    let commit = params.and_then(|params| params.0.commit);
    match enqueue_trigger(&ctx, &pipeline, commit.clone()).await {
        Ok(()) => (
            StatusCode::OK,
            Json(TriggerResponse {
                pipeline,
                commit,
                enqueued: true,
                error: None,
            }),
        ),
        Err(err) => {
            let status = match &err {
                TriggerError::NotFound(_) => StatusCode::NOT_FOUND,
                TriggerError::Unhealthy(_) | TriggerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (
                status,
                Json(TriggerResponse {
                    pipeline,
                    commit,
                    enqueued: false,
                    error: Some(err.to_string()),
                }),
            )
        }
    }
}

/// Validate a manual trigger and enqueue its build request.
///
/// Rejections never mutate the queue or any pipeline state: an unknown
/// pipeline is `NotFound`, a pipeline whose last revision check failed is
/// `Unhealthy`.
pub async fn enqueue_trigger(ctx: &TriggerCtx, pipeline: &str, commit: Option<String>) -> Result<(), TriggerError> {
    if !ctx.pipelines.load().contains_key(pipeline) {
        return Err(TriggerError::NotFound(pipeline.to_string()));
    }
    if ctx.state.get(pipeline).map(|state| state.check_error).unwrap_or(false) {
        return Err(TriggerError::Unhealthy(pipeline.to_string()));
    }

    let request = BuildRequest {
        pipeline: pipeline.to_string(),
        commit: commit.map(Commit::At).unwrap_or(Commit::Latest),
    };
    ctx.queue_tx.send(request).await.map_err(|err| TriggerError::Internal(err.to_string()))?;
    tracing::info!(pipeline = %pipeline, "manual build trigger enqueued");
    Ok(())
}
