//! Wire types exchanged with observers.
//!
//! Every frame is `{"event": <name>, "data": <payload>}` in both directions.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::adapter::RawInboundMessage;
use crate::errors::SendFailure;
use crate::ids::MessageId;

/// Display name used when the platform gives none.
pub const UNKNOWN_DISPLAY_NAME: &str = "Unknown";

/// Session status as presented to observers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObserverStatus {
    ScanQr,
    Connecting,
    Connected,
}

/// Events delivered to observers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ObserverEvent {
    QrCode(String),
    Status(ObserverStatus),
    NewMessage(InboundMessage),
    /// Only ever sent to the observer that requested the send.
    MessageSent(OutboundMessageEcho),
    /// Only ever sent to the observer that requested the send.
    SendFailed(SendFailedNotice),
}

impl ObserverEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::QrCode(_) => "qr_code",
            Self::Status(_) => "status",
            Self::NewMessage(_) => "new_message",
            Self::MessageSent(_) => "message_sent",
            Self::SendFailed(_) => "send_failed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub id: String,
    pub sender: String,
    pub text: String,
    pub timestamp: String,
    pub is_bot: bool,
    pub is_incoming: bool,
    pub display_name: String,
}

impl InboundMessage {
    /// Normalize a raw platform message received at `received_at`.
    pub fn normalize(raw: RawInboundMessage, received_at: DateTime<Utc>) -> Self {
        let display_name = raw
            .notify_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| UNKNOWN_DISPLAY_NAME.to_string());
        Self {
            id: raw.id,
            sender: raw.from,
            text: raw.body,
            timestamp: iso_timestamp(received_at),
            is_bot: false,
            is_incoming: true,
            display_name,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessageEcho {
    pub id: MessageId,
    pub sender: String,
    pub text: String,
    pub timestamp: String,
    pub is_bot: bool,
    pub is_incoming: bool,
    pub to: String,
}

impl OutboundMessageEcho {
    pub fn new(bot_identity: &str, request: &SendRequest, sent_at: DateTime<Utc>) -> Self {
        Self {
            id: MessageId::new(),
            sender: bot_identity.to_string(),
            text: request.text.clone(),
            timestamp: iso_timestamp(sent_at),
            is_bot: true,
            is_incoming: false,
            to: request.to.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendFailedNotice {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub error: String,
}

impl SendFailedNotice {
    pub fn from_failure(request: &SendRequest, failure: &SendFailure) -> Self {
        Self {
            to: Some(request.to.clone()),
            text: Some(request.text.clone()),
            error: failure.to_string(),
        }
    }
}

/// Payload of an observer's `send_message` frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    pub to: String,
    pub text: String,
}

/// Requests observers may issue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ObserverRequest {
    SendMessage(SendRequest),
}

/// Why an observer frame was not turned into a request.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RequestRejection {
    #[error("invalid json: {0}")]
    InvalidJson(String),
    #[error("frame has no event name")]
    MissingEvent,
    #[error("unknown event: {0}")]
    UnknownEvent(String),
    #[error("invalid send_message payload: {reason}")]
    InvalidSendPayload {
        to: Option<String>,
        text: Option<String>,
        reason: String,
    },
}

impl RequestRejection {
    /// Rejections the requester should hear about, as a `send_failed` notice.
    pub fn into_notice(self) -> Option<SendFailedNotice> {
        match self {
            Self::InvalidSendPayload { to, text, reason } => Some(SendFailedNotice {
                to,
                text,
                error: format!("invalid send_message payload: {reason}"),
            }),
            _ => None,
        }
    }
}

impl ObserverRequest {
    pub fn parse(raw: &str) -> Result<Self, RequestRejection> {
        let frame: Value =
            serde_json::from_str(raw).map_err(|e| RequestRejection::InvalidJson(e.to_string()))?;
        let event = frame
            .get("event")
            .and_then(Value::as_str)
            .ok_or(RequestRejection::MissingEvent)?;

        match event {
            "send_message" => {
                let data = frame.get("data").cloned().unwrap_or(Value::Null);
                let invalid = |reason: String| RequestRejection::InvalidSendPayload {
                    to: optional_str(&data, "to"),
                    text: optional_str(&data, "text"),
                    reason,
                };
                let request: SendRequest =
                    serde_json::from_value(data.clone()).map_err(|e| invalid(e.to_string()))?;
                if request.to.trim().is_empty() {
                    return Err(invalid("empty recipient".into()));
                }
                Ok(Self::SendMessage(request))
            }
            other => Err(RequestRejection::UnknownEvent(other.to_string())),
        }
    }
}

fn optional_str(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(String::from)
}

/// `2026-01-01T00:00:00.000Z`
pub fn iso_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}
