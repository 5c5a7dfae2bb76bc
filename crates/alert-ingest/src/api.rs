use crate::{Alert, Error, Ingest, Summary};
use axum::extract::State;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Path at which Alertmanager webhooks are accepted.
pub const ALERTS_PATH: &str = "/api/alerts";

/// Build a router which accepts batches of alerts at ALERTS_PATH.
pub fn build_router(ingest: Arc<Ingest>) -> axum::Router {
    axum::Router::new()
        .route(ALERTS_PATH, axum::routing::post(ingest_alerts))
        .with_state(ingest)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Build a router which serves Prometheus metrics from `prom_handle`.
pub fn metrics_router(prom_handle: PrometheusHandle) -> axum::Router {
    axum::Router::new()
        .route("/metrics", axum::routing::get(prometheus_metrics))
        .with_state(prom_handle)
}

// The body is decoded here rather than through axum's Json extractor, which
// would reject well-formed JSON of the wrong shape with a 422.
#[tracing::instrument(skip_all, err(level = tracing::Level::INFO))]
async fn ingest_alerts(
    State(ingest): State<Arc<Ingest>>,
    body: axum::body::Bytes,
) -> Result<axum::Json<Summary>, Error> {
    let alerts: Vec<Alert> = serde_json::from_slice(&body)?;
    let summary = ingest.ingest(alerts).await;

    tracing::debug!(?summary, "ingested alerts");
    Ok(axum::Json(summary))
}

#[tracing::instrument(skip_all)]
async fn prometheus_metrics(
    State(prom_handle): State<PrometheusHandle>,
) -> (axum::http::StatusCode, String) {
    (axum::http::StatusCode::OK, prom_handle.render())
}
