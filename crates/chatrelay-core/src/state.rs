//! Session lifecycle state as last reported by the external session.

use serde::{Deserialize, Serialize};

use crate::events::{ObserverEvent, ObserverStatus};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    #[default]
    Uninitialized,
    AwaitingScan,
    Authenticating,
    Connected,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "UNINITIALIZED",
            Self::AwaitingScan => "AWAITING_SCAN",
            Self::Authenticating => "AUTHENTICATING",
            Self::Connected => "CONNECTED",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time copy of the tracker, used to catch up late observers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub pending_credential: Option<String>,
}

impl SessionSnapshot {
    /// The single event a newly attached observer gets.
    ///
    /// A connected session wins over a stale credential; without either the
    /// observer is told to expect a code.
    pub fn catch_up_event(&self) -> ObserverEvent {
        if self.state == SessionState::Connected {
            ObserverEvent::Status(ObserverStatus::Connected)
        } else if let Some(token) = &self.pending_credential {
            ObserverEvent::QrCode(token.clone())
        } else {
            ObserverEvent::Status(ObserverStatus::ScanQr)
        }
    }
}

/// Holds the current lifecycle state and the pending pairing code.
///
/// Owned by the broker; transitions are not validated because the adapter
/// is the source of truth for ordering.
#[derive(Debug, Default)]
pub struct SessionStateTracker {
    state: SessionState,
    pending_credential: Option<String>,
}

impl SessionStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn pending_credential(&self) -> Option<&str> {
        self.pending_credential.as_deref()
    }

    pub fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    /// Store a freshly issued code. Issuing a code always means the session
    /// is waiting for a scan.
    pub fn set_pending_credential(&mut self, token: impl Into<String>) {
        self.pending_credential = Some(token.into());
        self.state = SessionState::AwaitingScan;
    }

    pub fn clear_pending_credential(&mut self) {
        self.pending_credential = None;
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            pending_credential: self.pending_credential.clone(),
        }
    }
}
