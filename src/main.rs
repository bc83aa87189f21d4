#![forbid(unsafe_code)]

use anyhow::Result;
use meetrelay::config::ServerConfig;
use meetrelay::metrics::ServerMetrics;
use meetrelay::room::RoomManager;
use meetrelay::signaling::SignalingServer;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meetrelay=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("MeetRelay - Starting server");

    let config = ServerConfig::from_env();
    match &config.ice.turn {
        Some(tc) => info!("TURN configured: {} URL(s), TTL {}s", tc.urls.len(), tc.ttl_secs),
        None => info!("No TURN configured (set TURN_URLS and TURN_SECRET to enable)"),
    }
    info!("Serving static assets from {}", config.static_dir.display());

    let metrics = ServerMetrics::new();
    let room_manager = Arc::new(RoomManager::new(metrics.clone()));
    let signaling_server = SignalingServer::new(room_manager.clone(), config, metrics);

    // Run server with graceful shutdown
    tokio::select! {
        result = signaling_server.serve() => {
            if let Err(e) = result {
                tracing::error!("Signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            room_manager.shutdown();
        }
    }

    info!("Server shutdown complete");
    Ok(())
}
