/// Error types for the inbox core
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InboxError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Authorization error: {0}")]
    Authorization(String),

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Fetch for thread {thread_id} superseded by a newer selection")]
    Superseded { thread_id: String },
}

/// Failure classes the UI distinguishes between
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Rejected locally; shown inline, never retried
    Validation,
    /// Not a party to the booking; the attempt is dropped
    Authorization,
    /// Network or storage trouble; previous state stays on screen
    Transient,
    /// Result discarded because the user moved on
    Superseded,
}

impl InboxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            InboxError::Validation(_) | InboxError::Config(_) => ErrorKind::Validation,
            InboxError::Authorization(_) => ErrorKind::Authorization,
            InboxError::Superseded { .. } => ErrorKind::Superseded,
            InboxError::Transient(_)
            | InboxError::Storage(_)
            | InboxError::Io(_)
            | InboxError::Serialization(_) => ErrorKind::Transient,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl From<sled::Error> for InboxError {
    fn from(e: sled::Error) -> Self {
        InboxError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, InboxError>;
