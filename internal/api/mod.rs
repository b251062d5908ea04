use crate::obs::Metrics;
use crate::sandbox::{self, SandboxMode};
use crate::storage::Storage;
use crate::util::config::Config;
use axum::extract::State;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub storage: Storage,
    pub metrics: Arc<Metrics>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("storage", &self.storage)
            .finish()
    }
}

impl AppState {
    pub async fn new(config: Config) -> Result<Self, String> {
        let metrics = Metrics::new();
        apply_sandbox_mode(&config.sandbox_mode)?;
        let storage = Storage::from_config(&config)
            .map_err(|err| format!("storage backend selection failed: {err}"))?;
        storage
            .init()
            .await
            .map_err(|err| format!("storage init failed: {err}"))?;
        Ok(Self {
            config,
            storage,
            metrics,
        })
    }
}

/// Observability surface, served on its own listener so it never collides
/// with the S3 bucket namespace.
pub fn metrics_router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

async fn metrics_handler(State(state): State<AppState>) -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&state.metrics.gather(), &mut buffer) {
        tracing::error!(error = %err, "metrics encoding failed");
    }
    String::from_utf8_lossy(&buffer).to_string()
}

fn apply_sandbox_mode(mode: &str) -> Result<(), String> {
    let registry = sandbox::registry();
    match mode {
        "off" => Ok(()),
        "auto" => registry
            .mode(SandboxMode::Auto)
            .map_err(|err| format!("sandbox mode failed: {err}")),
        "manual" => registry
            .mode(SandboxMode::Manual)
            .map_err(|err| format!("sandbox mode failed: {err}")),
        other => Err(format!(
            "PS3_SANDBOX_MODE must be off, auto, or manual (got {other})"
        )),
    }
}
