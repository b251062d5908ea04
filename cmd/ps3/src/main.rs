use ps3_core::api::{self, AppState};
use ps3_core::s3;
use ps3_core::util::config::Config;
use ps3_core::util::shutdown::shutdown_signal;
use ps3_core::util::usage;
use tracing_subscriber::EnvFilter;

const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if usage::handle_cli_flags(APP_VERSION) {
        return Ok(());
    }

    init_tracing();

    let config = Config::load()?;
    let state = AppState::new(config.clone()).await?;
    tracing::info!(
        backend = state.storage.kind().as_str(),
        sandbox_mode = %config.sandbox_mode,
        "storage backend ready"
    );

    let s3_listener = tokio::net::TcpListener::bind(&config.s3_listen).await?;
    let metrics_listener = tokio::net::TcpListener::bind(&config.metrics_listen).await?;
    tracing::info!(
        s3 = %config.s3_listen,
        metrics = %config.metrics_listen,
        "ps3 listening"
    );

    let s3_server = tokio::spawn(serve(s3_listener, s3::router(state.clone())));
    let metrics_server = tokio::spawn(serve(metrics_listener, api::metrics_router(state)));

    tokio::select! {
        _ = s3_server => {},
        _ = metrics_server => {},
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }
    Ok(())
}

async fn serve(listener: tokio::net::TcpListener, app: axum::Router) {
    let _ = axum::serve(listener, app).await;
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}
