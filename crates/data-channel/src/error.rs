//! Error types for peer sessions.

/// Errors produced by a transfer session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection timed out")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("unknown connection role byte 0x{0:02x}")]
    UnknownRole(u8),
}

impl SessionError {
    /// Error code worth telling the peer before closing, if any.
    pub fn peer_code(&self) -> Option<String> {
        match self {
            Self::Timeout => Some(crate::ERROR_TIMEOUT.to_string()),
            Self::Protocol(msg) => Some(msg.clone()),
            Self::InvalidRange(msg) => Some(format!("invalid range {msg}")),
            Self::UnknownRole(_) => Some("unknown role".to_string()),
            Self::Io(_) | Self::Cancelled | Self::Remote(_) => None,
        }
    }
}
