//! Error taxonomy shared by the store, the cache engine and the sync coordinator.
//!
//! Cache misses are not errors: lookups return `Option::None`. Network failures
//! live in [`crate::fetch::NetworkError`] and are converted into fallbacks by the
//! cache engine before they can reach a caller.
use thiserror::Error;

use crate::fetch::NetworkError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// The persistent store rejected a read or write.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    /// A generation could not be installed; nothing was activated.
    #[error("failed to install cache generation {generation}: {source}")]
    Install {
        generation: String,
        #[source]
        source: NetworkError,
    },
    /// Activation was asked to move a generation backwards or one that was never installed.
    #[error("cache generation {generation} cannot become active from phase {phase}")]
    GenerationLifecycle {
        generation: String,
        phase: &'static str,
    },
    /// A single queued action could not be replayed.
    #[error("replay of pending action {id} failed: {reason}")]
    SyncReplay { id: i64, reason: String },
    #[error("invalid request URL {0}")]
    InvalidUrl(String),
    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::StorageUnavailable(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Error::StorageUnavailable(format!("migration failed: {err}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::StorageUnavailable(format!("corrupt payload: {err}"))
    }
}
