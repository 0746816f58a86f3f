//! Error types for the envoy-metrics crate.

use thiserror::Error;

/// Errors that can occur while transforming metrics or tracking references.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// A tracked sensor name does not denote a lifetime counter.
    #[error("invalid tracked sensor '{name}': {reason}")]
    InvalidSensor {
        /// The rejected sensor name.
        name: String,
        /// Why the name was rejected.
        reason: String,
    },

    /// A retained reference payload could not be interpreted.
    #[error("invalid reference payload for '{key}': {payload:?}")]
    InvalidReference {
        /// The reference key the payload arrived on.
        key: String,
        /// The raw payload text.
        payload: String,
    },
}

/// Result type for metrics operations.
pub type Result<T> = std::result::Result<T, MetricsError>;
