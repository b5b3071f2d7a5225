use std::time::Duration;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Input rejected: {0}")]
    InvalidInput(String),

    #[error("External quota exhausted: {0}")]
    QuotaExhausted(String),

    #[error("Upstream call failed: {0}")]
    Upstream(String),

    #[error("Malformed model payload: {0}")]
    Malformed(String),

    #[error("No reviews available for analysis")]
    NoReviews,

    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task still in progress: {0}")]
    TaskPending(String),

    #[error("Task failed: {0}")]
    TaskFailed(String),

    #[error("Stored state inconsistent: {0}")]
    Inconsistent(String),

    #[error("Storage error: {0}")]
    Store(#[from] platecheck_store::StoreError),
}

impl EngineError {
    /// Quota exhaustion aborts bulk runs instead of failing a single unit.
    pub fn is_quota(&self) -> bool {
        matches!(self, EngineError::QuotaExhausted(_))
    }
}
