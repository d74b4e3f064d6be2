//! Job error types.

use crate::state::JobState;

/// Errors produced by transfer jobs.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("job {id} is {state} and accepts no connections")]
    Terminal { id: String, state: JobState },

    #[error("job {id} already has {max} connections")]
    TooManyConnections { id: String, max: usize },

    #[error("session pool is full")]
    PoolRejected,

    #[error("no job for the presented token")]
    UnknownToken,

    #[error("job {0} is already registered")]
    Duplicate(String),

    #[error("job {id} does not serve a peer in this direction")]
    WrongDirection { id: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("session error: {0}")]
    Session(#[from] imgsync_data_channel::SessionError),

    #[error("transfer error: {0}")]
    Transfer(#[from] imgsync_transfer::TransferError),

    #[error("config error: {0}")]
    Config(String),
}

impl JobError {
    /// Error code for a peer whose connection was refused.
    pub(crate) fn peer_code(&self) -> &'static str {
        match self {
            Self::Terminal { .. } => "transfer closed",
            Self::TooManyConnections { .. } => "too many connections",
            Self::PoolRejected => "server busy",
            Self::UnknownToken => "unknown token",
            Self::WrongDirection { .. } => "wrong direction",
            _ => "rejected",
        }
    }
}
