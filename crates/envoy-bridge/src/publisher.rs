//! The publish seam.
//!
//! The scheduler and status reporter only need `publish(topic, payload,
//! retained)`. The broker adapter lives in [`crate::mqtt`];
//! [`RecordingPublisher`] captures traffic for tests.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::{BridgeError, Result};

/// Something that can deliver messages to the broker.
#[allow(async_fn_in_trait)]
pub trait Publisher: Send + Sync + 'static {
    /// Publishes one message.
    fn publish(
        &self,
        topic: &str,
        payload: String,
        retained: bool,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// A message captured by [`RecordingPublisher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    /// Destination topic.
    pub topic: String,
    /// Payload text.
    pub payload: String,
    /// Whether the retained flag was set.
    pub retained: bool,
}

/// [`Publisher`] that records every message.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    messages: Mutex<Vec<Published>>,
    failing: AtomicBool,
}

impl RecordingPublisher {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent publishes fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Returns every message, oldest first.
    #[must_use]
    pub fn messages(&self) -> Vec<Published> {
        self.messages.lock().clone()
    }

    /// Returns the messages sent to `topic`, oldest first.
    #[must_use]
    pub fn on_topic(&self, topic: &str) -> Vec<Published> {
        self.messages
            .lock()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Returns the payload last sent to `topic`.
    #[must_use]
    pub fn last_payload(&self, topic: &str) -> Option<String> {
        self.messages
            .lock()
            .iter()
            .rev()
            .find(|m| m.topic == topic)
            .map(|m| m.payload.clone())
    }

    /// Forgets everything recorded so far.
    pub fn clear(&self) {
        self.messages.lock().clear();
    }
}

impl Publisher for RecordingPublisher {
    async fn publish(&self, topic: &str, payload: String, retained: bool) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BridgeError::Publish {
                topic: topic.to_string(),
                reason: "publisher set to fail".to_string(),
            });
        }
        self.messages.lock().push(Published {
            topic: topic.to_string(),
            payload,
            retained,
        });
        Ok(())
    }
}
