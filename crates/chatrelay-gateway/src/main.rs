//! chatrelay gateway
//!
//! - WebSocket endpoint: /ws
//! - Ops: /healthz, /readyz, /metrics
//! - Config: first CLI argument, default `chatrelay.yaml`

use std::net::SocketAddr;
use tracing_subscriber::{fmt, EnvFilter};

use chatrelay_core::error::{Result, RelayError};
use chatrelay_gateway::{app_state, broker, config, router};

const DEFAULT_CONFIG_PATH: &str = "chatrelay.yaml";

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let cfg = config::load_from_file(&path)?;
    let listen: SocketAddr = cfg
        .gateway
        .listen
        .parse()
        .map_err(|e| RelayError::Config(format!("gateway.listen: {e}")))?;

    let bridge = broker::from_config(&cfg.broker).await;
    let state = app_state::AppState::new(cfg, bridge.clone());
    let app = router::build_router(state);

    tracing::info!(%listen, broker = bridge.name(), "chatrelay-gateway starting");
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .map_err(|e| RelayError::Internal(format!("bind {listen} failed: {e}")))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| RelayError::Internal(format!("server failed: {e}")))?;

    bridge.shutdown().await;
    tracing::info!("chatrelay-gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "ctrl-c handler failed");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
