use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chatrelay_core::{BrokerHandle, ObserverId};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::connection::{self, ConnectionConfig};

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Per-observer outgoing queue; events beyond it are dropped.
    pub max_send_queue: usize,
    pub heartbeat_interval: Duration,
    /// Observers silent for this long are closed and detached.
    pub client_timeout: Duration,
}

impl ServerConfig {
    fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            max_send_queue: self.max_send_queue,
            heartbeat_interval: self.heartbeat_interval,
            client_timeout: self.client_timeout,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3001,
            max_send_queue: 256,
            heartbeat_interval: Duration::from_secs(30),
            client_timeout: Duration::from_secs(90),
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub broker: BrokerHandle,
    pub connection: ConnectionConfig,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Bind and serve. Returns a handle that owns the server task.
pub async fn start(config: ServerConfig, broker: BrokerHandle) -> Result<ServerHandle, std::io::Error> {
    let state = AppState {
        broker,
        connection: config.connection(),
    };
    let router = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(host = %config.host, port = local_addr.port(), "chatrelay server started");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "server stopped");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        server,
    })
}

/// Handle returned by `start()`; the server runs until it is shut down.
pub struct ServerHandle {
    pub port: u16,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn shutdown(self) {
        self.server.abort();
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let observer = ObserverId::new();
    tracing::info!(observer_id = %observer, "observer connected");

    connection::handle_ws_connection(socket, observer.clone(), state.broker, state.connection)
        .await;

    tracing::info!(observer_id = %observer, "observer disconnected");
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.broker.status().await {
        Some(status) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "session": status.session,
                "has_pending_credential": status.has_pending_credential,
                "observers": status.observers,
            })),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable" })),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 3001);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.max_send_queue, 256);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.client_timeout, Duration::from_secs(90));
    }

    #[test]
    fn build_router_creates_routes() {
        let (tx, _rx) = mpsc::channel(8);
        let state = AppState {
            broker: BrokerHandle::new(tx),
            connection: ConnectionConfig::default(),
        };
        let _router = build_router(state);
    }

    #[tokio::test]
    async fn health_unavailable_when_broker_stopped() {
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        let state = AppState {
            broker: BrokerHandle::new(tx),
            connection: ConnectionConfig::default(),
        };
        let response = health_handler(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
