use anyhow::Context;
use futures::FutureExt;
use std::sync::Arc;

mod api;
mod identity;
mod ingest;
mod lifecycle;
mod sink;

pub use api::{build_router, metrics_router, ALERTS_PATH};
pub use identity::{derive as derive_id, Alert, AlertId, LABELS, SEPARATOR};
pub use ingest::{Ingest, IngestConfig, Summary};
pub use lifecycle::{LifecycleStore, Transition};
pub use sink::{Event, Sink, StdoutSink};

/// Error that describes a rejected request or alert.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Decode(#[from] serde_json::Error),
    #[error("alert has no \"Labels\" field")]
    MissingLabels,
    #[error("alert \"Labels\" field is not an object")]
    LabelsNotObject,
    #[error("label {0:?} is not a scalar value")]
    LabelNotScalar(String),
}

impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        (axum::http::StatusCode::BAD_REQUEST, self.to_string()).into_response()
    }
}

/// Alert-ingest receives Prometheus Alertmanager webhooks, and emits
/// events as alerts become active and inactive.
#[derive(clap::Parser, Debug)]
#[command(about, version)]
pub struct Args {
    /// Prefix of emitted event tags.
    #[arg(long, env = "TAG")]
    pub tag: String,
    /// Address to listen on for webhook requests.
    #[arg(long, env = "BIND", default_value = "0.0.0.0:9095")]
    pub bind: String,
    /// Emit only the first occurrence of an alert while it remains active.
    #[arg(long, env = "FIRST_ONLY")]
    pub first_only: bool,
    /// Duration after which an alert that's not received again becomes
    /// inactive, like "5m". Disabled if unset or zero.
    #[arg(long, env = "TTL")]
    pub ttl: Option<humantime::Duration>,
    /// Log as structured JSON.
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

impl Args {
    pub fn ingest_config(&self) -> IngestConfig {
        IngestConfig {
            tag: self.tag.clone(),
            first_only: self.first_only,
            ttl: self.ttl.as_deref().copied(),
        }
    }
}

/// Serve webhook requests until signaled to stop, writing events to stdout.
/// If `prom_handle` is given, metrics are also served at "/metrics".
pub async fn run(
    args: Args,
    prom_handle: Option<metrics_exporter_prometheus::PrometheusHandle>,
) -> anyhow::Result<()> {
    let config = args.ingest_config();

    // Bind before anything else, so that a bad address fails startup.
    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;

    tracing::info!(
        bind = %args.bind,
        tag = %config.tag,
        first_only = config.first_only,
        ttl = ?config.ttl,
        tracks_identities = config.tracks_identities(),
        "alert-ingest listening"
    );

    let ingest = Arc::new(Ingest::new(config, Arc::new(StdoutSink)));

    let mut app = build_router(ingest);
    if let Some(prom_handle) = prom_handle {
        app = app.merge(metrics_router(prom_handle));
    }

    let shutdown = tokio::signal::ctrl_c().map(|_| ());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("serving HTTP")?;

    tracing::info!("alert-ingest stopped");
    Ok(())
}
