use thiserror::Error;

pub type Result<T> = std::result::Result<T, ApifyError>;

#[derive(Debug, Error)]
pub enum ApifyError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// Plan/quota limit exceeded (HTTP 402, actor memory limits, usage hard
    /// limits). Distinguished from `Api` so callers orchestrating many runs
    /// can abort the remainder instead of retrying into the same wall.
    #[error("Apify quota exceeded (status {status}): {message}")]
    QuotaExceeded { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),
}

impl ApifyError {
    /// Classify an unsuccessful HTTP response.
    pub(crate) fn from_status(status: u16, message: String) -> Self {
        if status == 402
            || message.contains("actor-memory-limit-exceeded")
            || message.contains("usage-hard-limit-exceeded")
        {
            ApifyError::QuotaExceeded { status, message }
        } else {
            ApifyError::Api { status, message }
        }
    }

    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, ApifyError::QuotaExceeded { .. })
    }
}

impl From<reqwest::Error> for ApifyError {
    fn from(err: reqwest::Error) -> Self {
        ApifyError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for ApifyError {
    fn from(err: serde_json::Error) -> Self {
        ApifyError::Parse(err.to_string())
    }
}
