//! Error types for the envoy-client crate.

use thiserror::Error;

/// Maximum number of response characters carried in a parse error.
pub const PREVIEW_LEN: usize = 200;

/// Errors that can occur while talking to the cloud or the local gateway.
#[derive(Debug, Error)]
pub enum ClientError {
    /// One of the authentication steps failed.
    #[error("authentication failed during {step}: {reason}")]
    Authentication {
        /// The handshake step that failed (`login`, `token`, `validate`).
        step: &'static str,
        /// What went wrong.
        reason: String,
    },

    /// The request never produced a response (connect error, timeout).
    #[error("transport error for {endpoint}: {reason}")]
    Transport {
        /// The endpoint being called.
        endpoint: String,
        /// Description of the failure.
        reason: String,
    },

    /// The server answered with a non-success status.
    #[error("{endpoint} returned HTTP {status}")]
    HttpStatus {
        /// The endpoint being called.
        endpoint: String,
        /// The HTTP status code.
        status: u16,
    },

    /// The response body could not be interpreted.
    #[error("could not parse response from {endpoint}: {reason} (body starts with {preview:?})")]
    Parse {
        /// The endpoint being called.
        endpoint: String,
        /// Description of the failure.
        reason: String,
        /// Start of the response body.
        preview: String,
    },
}

impl ClientError {
    /// Returns true for 401-class responses, which warrant re-authentication.
    #[must_use]
    pub const fn is_unauthorized(&self) -> bool {
        matches!(self, Self::HttpStatus { status: 401, .. })
    }

    /// Creates a parse error with a truncated body preview.
    #[must_use]
    pub fn parse(endpoint: impl Into<String>, reason: impl Into<String>, body: &str) -> Self {
        Self::Parse {
            endpoint: endpoint.into(),
            reason: reason.into(),
            preview: preview(body),
        }
    }
}

/// Returns at most [`PREVIEW_LEN`] characters of a response body.
#[must_use]
pub fn preview(body: &str) -> String {
    body.chars().take(PREVIEW_LEN).collect()
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
