use axum::http::StatusCode;
use thiserror::Error;

/// Failures that can cross the relay boundary.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Invalid JSON payload.")]
    InvalidJson(#[source] serde_json::Error),

    #[error("Message is required.")]
    EmptyMessage,

    #[error("Authentication required.")]
    Unauthorized,

    #[error("agent backend error: {0}")]
    Backend(String),

    #[error("agent backend schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("agent backend did not answer within {0}s")]
    Timeout(u64),

    #[error("conversation store error: {0}")]
    Store(String),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::InvalidJson(_) | RelayError::EmptyMessage => StatusCode::BAD_REQUEST,
            RelayError::Unauthorized => StatusCode::UNAUTHORIZED,
            RelayError::Backend(_)
            | RelayError::SchemaMismatch(_)
            | RelayError::Timeout(_)
            | RelayError::Store(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Text that is safe to hand back to a client. Service-side failures
    /// collapse into one generic apology.
    pub fn public_message(&self) -> String {
        match self.status() {
            StatusCode::BAD_GATEWAY => "Assistant service error.".to_string(),
            _ => self.to_string(),
        }
    }
}

impl From<redis::RedisError> for RelayError {
    fn from(err: redis::RedisError) -> Self {
        RelayError::Store(err.to_string())
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        RelayError::Backend(err.to_string())
    }
}
