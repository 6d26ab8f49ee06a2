use std::time::Duration;

/// Errors raised by a session provider.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("failed to start session provider: {0}")]
    Spawn(String),

    #[error("provider i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("provider protocol error: {0}")]
    Protocol(String),

    #[error("{0}")]
    Rejected(String),

    #[error("session is closed")]
    Closed,

    #[error("provider did not answer within {0:?}")]
    Timeout(Duration),
}

impl From<serde_json::Error> for ChannelError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;
