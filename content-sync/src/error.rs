//! Error taxonomy for the synchronization core.

use thiserror::Error;

/// Failure reading from the authoritative content store.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("source returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid response: {0}")]
    Decode(String),

    #[error("source unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum SyncError {
    /// Malformed or incomplete change event. Never retried.
    #[error("invalid change event: {}", .errors.join("; "))]
    Validation { errors: Vec<String> },

    /// Signature mismatch. Never retried; counted as a security event.
    #[error("change event signature does not match")]
    Authenticity,

    /// Timestamp outside the freshness window.
    #[error("change event is {age_ms}ms from now, outside the {window_ms}ms freshness window")]
    StaleEvent { age_ms: i64, window_ms: u64 },

    /// Handler or invalidation failure. Retried with backoff.
    #[error("processing failed: {0}")]
    Processing(String),

    #[error("snapshot fetch failed: {0}")]
    Fetch(#[from] FetchError),
}

impl SyncError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            errors: vec![message.into()],
        }
    }

    pub fn processing(message: impl Into<String>) -> Self {
        Self::Processing(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Processing(_) | SyncError::Fetch(_))
    }

    pub fn is_security_event(&self) -> bool {
        matches!(self, SyncError::Authenticity)
    }

    /// Short machine-readable name, used in logs and wire responses.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Validation { .. } => "validation_error",
            SyncError::Authenticity => "authenticity_error",
            SyncError::StaleEvent { .. } => "stale_event_error",
            SyncError::Processing(_) => "processing_error",
            SyncError::Fetch(_) => "fetch_error",
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to encode update: {0}")]
    Encode(#[from] serde_json::Error),
}
