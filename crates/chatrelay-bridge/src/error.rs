use thiserror::Error;

/// Errors on the link between the relay and the session sidecar.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] serde_json::Error),
}
