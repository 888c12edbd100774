//! Errors raised by persistence backends.
//!
//! Two kinds are transient and may be retried by callers: [`PersistenceError::Io`] for a failed I/O
//! operation and [`PersistenceError::Unreachable`] when the backend cannot be reached at all. Every other
//! kind denotes a data or programming problem which retrying would only hide.

use model::error::DecodeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Internal IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Repository is not reachable: {0}")]
    Unreachable(String),

    #[error("`{0}` is not found")]
    NotFound(String),

    #[error("Data corrupted: {0}")]
    DataCorrupted(String),

    #[error("Failed to decode archive index")]
    Decode(#[from] DecodeError),

    #[error("Object storage error: {0}")]
    ObjectStorage(opendal::Error),

    #[error("Configuration invalid: `{0}`")]
    Configuration(String),

    #[error("Internal error: `{0}`")]
    Internal(String),
}

impl PersistenceError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PersistenceError::Io(_) | PersistenceError::Unreachable(_)
        )
    }
}

impl From<opendal::Error> for PersistenceError {
    fn from(e: opendal::Error) -> Self {
        match e.kind() {
            opendal::ErrorKind::NotFound => PersistenceError::NotFound(e.to_string()),
            _ if e.is_temporary() => PersistenceError::Unreachable(e.to_string()),
            opendal::ErrorKind::RateLimited | opendal::ErrorKind::Unexpected => {
                PersistenceError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
            }
            _ => PersistenceError::ObjectStorage(e),
        }
    }
}
