//! Liveness reporting.

use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};

use crate::publisher::Publisher;

/// Liveness value published on the status topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// The bridge is running.
    Online,
    /// The bridge stopped or lost its broker connection.
    Offline,
}

impl Liveness {
    /// Payload text.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Publishes retained liveness values. Failures are logged and swallowed.
#[derive(Debug)]
pub struct StatusReporter<P> {
    publisher: Arc<P>,
    topic: String,
}

impl<P: Publisher> StatusReporter<P> {
    /// Creates a reporter for `topic`.
    #[must_use]
    pub fn new(publisher: Arc<P>, topic: impl Into<String>) -> Self {
        Self {
            publisher,
            topic: topic.into(),
        }
    }

    /// Returns the status topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publishes `state`; returns whether the broker accepted it.
    pub async fn publish_status(&self, state: Liveness) -> bool {
        match self
            .publisher
            .publish(&self.topic, state.as_str().to_string(), true)
            .await
        {
            Ok(()) => {
                info!(topic = %self.topic, status = %state, "status published");
                true
            }
            Err(e) => {
                warn!(topic = %self.topic, status = %state, error = %e, "failed to publish status");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::RecordingPublisher;

    #[tokio::test]
    async fn publishes_retained_liveness() {
        let publisher = Arc::new(RecordingPublisher::new());
        let reporter = StatusReporter::new(Arc::clone(&publisher), "envoy/1/lwt");

        assert!(reporter.publish_status(Liveness::Online).await);
        assert!(reporter.publish_status(Liveness::Offline).await);

        let messages = publisher.on_topic("envoy/1/lwt");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].payload, "online");
        assert_eq!(messages[1].payload, "offline");
        assert!(messages.iter().all(|m| m.retained));
    }

    #[tokio::test]
    async fn failures_are_swallowed() {
        let publisher = Arc::new(RecordingPublisher::new());
        publisher.set_failing(true);
        let reporter = StatusReporter::new(Arc::clone(&publisher), "envoy/1/lwt");

        assert!(!reporter.publish_status(Liveness::Offline).await);
    }
}
