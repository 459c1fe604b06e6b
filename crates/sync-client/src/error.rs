//! Error types for the sync API client.

use aula_core::sync::{classify_http_status, SyncRetryClass};
use thiserror::Error;

/// Result type alias for sync API operations.
pub type Result<T> = std::result::Result<T, SyncApiError>;

/// Errors that can occur while talking to the sync service.
#[derive(Debug, Error)]
pub enum SyncApiError {
    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// API error response from the sync service
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Invalid request (missing required data, malformed base URL, etc.)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Authentication error (missing or invalid token)
    #[error("Authentication error: {0}")]
    Auth(String),
}

impl SyncApiError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    /// HTTP status if this is an API error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Classify error for retry policy.
    pub fn retry_class(&self) -> SyncRetryClass {
        match self {
            Self::Api { status, .. } => classify_http_status(*status),
            Self::Http(_) => SyncRetryClass::Retryable,
            Self::Json(_) => SyncRetryClass::Permanent,
            Self::InvalidRequest(_) => SyncRetryClass::Permanent,
            Self::Auth(_) => SyncRetryClass::ReauthRequired,
        }
    }

    /// Transport failures never reached the server; the whole round trip is
    /// safe to retry with no local state change.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Http(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_class_for_auth_error_is_reauth() {
        let err = SyncApiError::api(401, "unauthorized");
        assert_eq!(err.retry_class(), SyncRetryClass::ReauthRequired);
    }

    #[test]
    fn retry_class_for_server_errors_is_retryable() {
        assert_eq!(
            SyncApiError::api(503, "unavailable").retry_class(),
            SyncRetryClass::Retryable
        );
        assert_eq!(
            SyncApiError::api(400, "bad request").retry_class(),
            SyncRetryClass::Permanent
        );
    }
}
