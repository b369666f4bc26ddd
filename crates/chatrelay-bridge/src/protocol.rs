//! Frames exchanged with the session sidecar.
//!
//! Relay → sidecar: `initialize`, `send`.
//! Sidecar → relay: `qr`, `authenticated`, `ready`, `message`, `send_result`,
//! plus `auth_failure` / `disconnected`, which are logged only.

use chatrelay_core::{AdapterEvent, RawInboundMessage, SendFailure};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeRequest {
    Initialize,
    Send {
        #[serde(rename = "requestId")]
        request_id: String,
        to: String,
        text: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    Qr {
        code: String,
    },
    Authenticated,
    Ready,
    Message(RawInboundMessage),
    SendResult {
        #[serde(rename = "requestId")]
        request_id: String,
        ok: bool,
        #[serde(default)]
        error: Option<String>,
    },
    AuthFailure {
        #[serde(default)]
        message: Option<String>,
    },
    Disconnected {
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

impl BridgeEvent {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Lifecycle and message frames map onto adapter events; the rest are
    /// handled by the link itself or only logged.
    pub fn into_adapter_event(self) -> Option<AdapterEvent> {
        match self {
            Self::Qr { code } => Some(AdapterEvent::CredentialIssued(code)),
            Self::Authenticated => Some(AdapterEvent::Authenticated),
            Self::Ready => Some(AdapterEvent::Ready),
            Self::Message(raw) => Some(AdapterEvent::InboundMessage(raw)),
            Self::SendResult { .. } => None,
            Self::AuthFailure { message } => {
                warn!(message = message.as_deref().unwrap_or(""), "sidecar reported auth failure");
                None
            }
            Self::Disconnected { reason } => {
                warn!(reason = reason.as_deref().unwrap_or(""), "sidecar session disconnected");
                None
            }
            Self::Unknown => {
                debug!("ignoring unknown sidecar frame");
                None
            }
        }
    }
}

/// Outcome carried by a `send_result` frame.
pub fn send_outcome(ok: bool, error: Option<String>) -> Result<(), SendFailure> {
    if ok {
        Ok(())
    } else {
        Err(SendFailure::Rejected(
            error.unwrap_or_else(|| "send rejected".into()),
        ))
    }
}
