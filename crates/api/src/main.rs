//! Stratix API server

use std::net::SocketAddr;
use std::time::Duration;

use stratix_api::{create_router, AppState, Config};
use tokio::signal;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "stratix_api=info,stratix_auth=info,tower_http=info";

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    match std::env::var("LOG_FORMAT").unwrap_or_default().to_lowercase().as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer())
                .init();
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}

/// Request history kept per identity for anomaly detection
const ANOMALY_MAX_IDLE: Duration = Duration::from_secs(24 * 60 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::from_env()?;
    let bind_address = config.bind_address.clone();
    let sweep_interval = Duration::from_secs(config.rate_limit_sweep_seconds);
    tracing::info!(
        provider = ?config.identity_provider,
        database = config.database_url.is_some(),
        deny_patterns = config.suspicious_identity_patterns.len(),
        "Starting Stratix API"
    );

    let state = AppState::from_config(config).await?;
    let sweeper = state.limiter.spawn_cleanup_task(sweep_interval);
    let anomaly_sweeper = state
        .validator
        .spawn_anomaly_sweep(sweep_interval, ANOMALY_MAX_IDLE);

    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    tracing::info!(address = %bind_address, "Listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    sweeper.abort();
    anomaly_sweeper.abort();
    tracing::info!("Server stopped");
    Ok(())
}
