//! Error types for envoy-bridge.

use thiserror::Error;

/// Errors that can occur while running the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Gateway access failed.
    #[error(transparent)]
    Client(#[from] envoy_client::ClientError),

    /// Reference tracking rejected its input.
    #[error(transparent)]
    Metrics(#[from] envoy_metrics::MetricsError),

    /// A message could not be handed to the broker.
    #[error("failed to publish to '{topic}': {reason}")]
    Publish {
        /// Destination topic.
        topic: String,
        /// Description of the failure.
        reason: String,
    },

    /// Payload serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;
    use envoy_client::ClientError;

    #[test]
    fn test_error_display() {
        let err = BridgeError::Config("mqtt.port must be greater than 0".to_string());
        assert_eq!(
            err.to_string(),
            "configuration error: mqtt.port must be greater than 0"
        );

        let err = BridgeError::Publish {
            topic: "envoy/1/lwt".to_string(),
            reason: "request queue closed".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "failed to publish to 'envoy/1/lwt': request queue closed"
        );
    }

    #[test]
    fn test_client_error_is_transparent() {
        let err: BridgeError = ClientError::HttpStatus {
            endpoint: "/ivp/meters".to_string(),
            status: 500,
        }
        .into();
        assert_eq!(err.to_string(), "/ivp/meters returned HTTP 500");
    }
}
