use std::time::Duration;

/// Failure of an outbound send through the external session.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SendFailure {
    /// The external session refused the message (bad chat id, blocked, ...).
    #[error("rejected by session: {0}")]
    Rejected(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("session not connected")]
    NotConnected,
    #[error("no send result after {0:?}")]
    Timeout(Duration),
}

impl SendFailure {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Rejected(_) => "rejected",
            Self::Transport(_) => "transport",
            Self::NotConnected => "not_connected",
            Self::Timeout(_) => "timeout",
        }
    }
}
