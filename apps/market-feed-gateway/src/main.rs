//! Market Feed Gateway Binary
//!
//! Starts the upstream feed client and the HTTP control plane.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-feed-gateway
//! ```
//!
//! # Environment Variables
//!
//! ## Required (for upstream data)
//! - `FEED_API_KEY`: provider API key
//!
//! ## Optional
//! - `FEED_URL`: provider WebSocket URL
//! - `FEED_AUTO_CONNECT`: connect at startup (default: true)
//! - `FEED_INITIAL_SYMBOLS`: comma-separated symbols subscribed at startup
//! - `GATEWAY_HTTP_PORT`: control plane port (default: 8000)
//! - `SESSION_OUTBOUND_CAPACITY`: per-session mailbox size (default: 256)
//! - `SESSION_OVERFLOW_POLICY`: `drop_newest` | `disconnect`
//! - `OTEL_ENABLED`: export spans over OTLP (default: false)
//! - `RUST_LOG`: log filter (default: `market_feed_gateway=info`)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use market_feed_gateway::infrastructure::config::load_dotenv;
use market_feed_gateway::infrastructure::telemetry;
use market_feed_gateway::{
    ControlPlaneServer, ControlPlaneState, Gateway, GatewayConfig, TungsteniteConnector,
    init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Already installed is fine.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let dotenv_path = load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!(dotenv = ?dotenv_path, "Starting Market Feed Gateway");

    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Prometheus recorder not installed");
    }

    let config = GatewayConfig::from_env().context("invalid gateway configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let gateway = Arc::new(Gateway::new(
        config.feed_client_config(),
        config.gateway_settings(),
        Arc::new(TungsteniteConnector::new()),
        shutdown_token.clone(),
    ));

    if let Err(e) = gateway.start().await {
        tracing::warn!(error = %e, "Upstream feed not started, will connect on first subscribe");
    }

    let state = Arc::new(ControlPlaneState::new(
        Arc::clone(&gateway),
        env!("CARGO_PKG_VERSION"),
    ));
    let server = ControlPlaneServer::new(config.server.http_port, state, shutdown_token.clone());
    let server_task = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            tracing::error!(error = %e, "Control plane error");
        }
    });

    tracing::info!("Gateway ready");

    await_shutdown(shutdown_token).await;

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        gateway.shutdown().await;
        let _ = server_task.await;
    })
    .await
    .is_err()
    {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Graceful shutdown timed out"
        );
    }

    tracing::info!("Gateway stopped");
    Ok(())
}

/// Log the parsed configuration.
fn log_config(config: &GatewayConfig) {
    tracing::info!(
        feed_url = %config.feed.url,
        api_key_set = config.feed.credentials.is_some(),
        auto_connect = config.feed.auto_connect,
        initial_symbols = config.feed.initial_symbols.len(),
        http_port = config.server.http_port,
        session_capacity = config.sessions.outbound_capacity,
        overflow_policy = config.sessions.overflow_policy.as_str(),
        "Configuration loaded"
    );
}

/// Wait for SIGINT or SIGTERM, then cancel the root token.
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
