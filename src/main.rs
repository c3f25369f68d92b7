use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing_subscriber::{fmt, EnvFilter};

mod config;
mod error;
mod functions;
mod gate;
mod hub;
mod models;
mod orchestrator;
mod router;
mod session;
mod supervisor;
mod transcript;
mod transcription;
mod upstream;
mod voice_agent;

use crate::config::AppConfig;
use crate::functions::FunctionRegistry;
use crate::hub::RoomHub;
use crate::session::AppState;
use crate::supervisor::AgentSupervisor;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Arc::new(AppConfig::load()?);

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format.as_str() {
        "json" => {
            fmt().with_env_filter(filter).json().init();
        }
        _ => {
            fmt().with_env_filter(filter).init();
        }
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        voice_agent = %config.upstream.voice_agent_url,
        transcription = %config.upstream.transcription_url,
        stt_model = %config.agent.stt_model,
        "Starting CoachBridge server"
    );

    // Room hub and background sweeper
    let hub = RoomHub::new(
        config.reconnect_grace(),
        config.limits.eviction_drop_threshold,
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = tokio::spawn(hub.clone().run_sweeper(shutdown_rx.clone()));

    // Function handlers are integrator-provided; the broker runs with an
    // empty table and answers unknown calls with an error string.
    let registry = Arc::new(FunctionRegistry::new());
    let supervisor = AgentSupervisor::new(hub.clone(), config.clone(), registry, None);
    let supervisor_task = tokio::spawn(supervisor.clone().run(shutdown_rx));

    // Build HTTP + WebSocket router
    let state = AppState {
        hub,
        config: config.clone(),
    };
    let app = session::build_router(state);

    // Bind and serve
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Signaling server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop agents first so upstreams get a clean 1000 close, then the
    // background tasks.
    supervisor.shutdown_all().await;
    let _ = shutdown_tx.send(true);
    let _ = supervisor_task.await;
    let _ = sweeper.await;

    tracing::info!("CoachBridge server stopped gracefully");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C handler");
    tracing::info!("Shutdown signal received");
}
