#![forbid(unsafe_code)]

// Signaling module - WebSocket signaling server

pub mod connection;
pub mod protocol;

use crate::config::ServerConfig;
use crate::ice::IceServer;
use crate::metrics::ServerMetrics;
use crate::room::RoomManager;
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use connection::ConnectionLimits;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{info, warn};
use uuid::Uuid;

/// Signaling server state
#[derive(Clone)]
pub struct SignalingServer {
    room_manager: Arc<RoomManager>,
    config: Arc<ServerConfig>,
    metrics: ServerMetrics,
    connection_semaphore: Arc<Semaphore>,
}

impl SignalingServer {
    /// Creates a new signaling server
    pub fn new(room_manager: Arc<RoomManager>, config: ServerConfig, metrics: ServerMetrics) -> Self {
        info!("Max connections: {}", config.max_connections);
        if config.metrics_token.is_none() {
            info!("METRICS_TOKEN not set, /metrics is public");
        }

        Self {
            room_manager,
            connection_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            config: Arc::new(config),
            metrics,
        }
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.room_manager
    }

    /// Creates the Axum router for the signaling server
    pub fn router(self) -> Router {
        let static_dir = ServeDir::new(&self.config.static_dir);

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/api/ice-servers", get(ice_servers_handler))
            .with_state(self)
            .layer(CorsLayer::permissive())
            .fallback_service(static_dir)
    }

    /// Binds the configured address and serves until the listener fails
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the port
    pub async fn serve(self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(addr).await?;
        self.serve_with_listener(listener).await
    }

    /// Serves on an already bound listener
    pub async fn serve_with_listener(self, listener: TcpListener) -> anyhow::Result<()> {
        info!("Signaling server listening on {}", listener.local_addr()?);
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

/// Health check handler
async fn health_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "rooms": server.room_manager.room_count(),
        "participants": server.room_manager.participant_count(),
    }))
}

/// Metrics handler, Prometheus text exposition format.
/// Protected by the optional metrics token (Bearer auth).
async fn metrics_handler(State(server): State<SignalingServer>, headers: HeaderMap) -> Response {
    if let Some(expected) = &server.config.metrics_token {
        let provided = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != format!("Bearer {expected}") {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let body = server.metrics.render_prometheus(
        server.room_manager.room_count(),
        server.room_manager.participant_count(),
    );
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

/// ICE servers for a client about to open peer sessions
async fn ice_servers_handler(State(server): State<SignalingServer>) -> Json<Vec<IceServer>> {
    let label = Uuid::new_v4().to_string();
    Json(server.config.ice.ice_servers(&label))
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(server): State<SignalingServer>) -> Response {
    // Acquire connection permit (non-blocking)
    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, rejecting WebSocket upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    let limits = ConnectionLimits {
        idle_timeout: server.config.idle_timeout,
        heartbeat_interval: server.config.heartbeat_interval(),
        rate_limit_per_sec: server.config.rate_limit_per_sec,
    };

    ws.max_message_size(server.config.max_message_size)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| {
            connection::handle_connection(socket, server.room_manager, limits, server.metrics, permit)
        })
}
