//! Error types for BuildIt.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Another worker holds a live lease. Callers skip the job.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The caller no longer owns the lease and must discard local work.
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("already terminal: {0}")]
    AlreadyTerminal(String),

    #[error("timeout: {0}")]
    Timeout(String),

    /// Retries exhausted. Requires operator intervention.
    #[error("lost: {0}")]
    Lost(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// Store, queue or notifier endpoint unreachable. Safe to retry.
    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the operation may succeed if retried later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Unavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
