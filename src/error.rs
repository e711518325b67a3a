use thiserror::Error;

#[derive(Error, Debug)]
pub enum SockdError {
    #[error("startup lock is contended: {0}")]
    LockContended(String),

    #[error("lost the startup lock race: {0}")]
    LockLost(String),

    #[error("failed to bind daemon endpoint: {0}")]
    Bind(std::io::Error),

    #[error("failed to connect to daemon: {0}")]
    Connection(String),

    #[error("daemon protocol error: {0}")]
    Protocol(String),

    #[error("request cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SockdError {
    /// True for the contention flavor of lock failure, which the election
    /// treats as "someone else is starting up" rather than as fatal.
    pub fn is_lock_contention(&self) -> bool {
        matches!(self, SockdError::LockContended(_))
    }
}

pub type Result<T> = std::result::Result<T, SockdError>;
