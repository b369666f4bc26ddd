//! The seam to the external messaging session.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::SendFailure;

/// A message as the external platform reports it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawInboundMessage {
    pub id: String,
    pub from: String,
    pub body: String,
    #[serde(default, rename = "notifyName")]
    pub notify_name: Option<String>,
}

/// Lifecycle and message events emitted by a session adapter, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdapterEvent {
    /// The session needs out-of-band pairing with this code.
    CredentialIssued(String),
    Authenticated,
    Ready,
    InboundMessage(RawInboundMessage),
}

impl AdapterEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::CredentialIssued(_) => "credential_issued",
            Self::Authenticated => "authenticated",
            Self::Ready => "ready",
            Self::InboundMessage(_) => "inbound_message",
        }
    }
}

/// Trait implemented by each external session backend.
#[async_trait]
pub trait SessionAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Start connecting. Returns once the connection process is under way;
    /// everything afterwards, including failures, arrives on `events`.
    async fn initialize(&self, events: mpsc::Sender<AdapterEvent>);

    async fn send_message(&self, to: &str, text: &str) -> Result<(), SendFailure>;
}
