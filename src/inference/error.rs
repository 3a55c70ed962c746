//! Error types for the inference service client.
//!
//! Every failure of a single call lands in [`InferenceError`]. Callers never
//! coerce these into an "incorrect" verdict; they surface at the per-item
//! boundary unless a bounded retry wrapper absorbs them first.

use thiserror::Error;

/// Errors raised by one call to the inference service.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// The server returned HTTP 429.
    /// `retry_after_ms` is the minimum wait before the next attempt.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Any other non-success status (401 bad key, 500 internal error, ...).
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    /// Underlying transport failure (DNS, connection refused, body decode).
    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    /// The call exceeded its configured upper bound.
    #[error("request timed out")]
    Timeout,

    /// The service answered but the message content was missing or blank.
    #[error("empty response from inference service")]
    EmptyResponse,

    /// The reply body did not have the expected shape.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// A context image could not be read for upload.
    #[error("could not read image {path}: {source}")]
    Image {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl InferenceError {
    /// Whether repeating the identical call could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, InferenceError::Image { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_display() {
        let err = InferenceError::RateLimited {
            retry_after_ms: 5000,
        };
        assert_eq!(err.to_string(), "rate limited, retry after 5000ms");
    }

    #[test]
    fn api_error_display() {
        let err = InferenceError::ApiError {
            status: 401,
            message: "Invalid API key".into(),
        };
        assert_eq!(err.to_string(), "API error (status 401): Invalid API key");
    }

    #[test]
    fn image_errors_are_not_transient() {
        let err = InferenceError::Image {
            path: "missing.jpg".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "nope"),
        };
        assert!(!err.is_transient());
        assert!(InferenceError::Timeout.is_transient());
        assert!(InferenceError::EmptyResponse.is_transient());
    }
}
