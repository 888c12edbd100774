use persistence::PersistenceError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("Segment fetch task of `{archive}` failed: {source}")]
    Join {
        archive: String,
        #[source]
        source: tokio::task::JoinError,
    },
}
