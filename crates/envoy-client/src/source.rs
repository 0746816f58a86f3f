//! The telemetry seam consumed by the scheduler.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use envoy_metrics::DeviceSnapshot;
use parking_lot::Mutex;

use crate::error::{ClientError, Result};

/// Something that can produce device snapshots.
#[allow(async_fn_in_trait)]
pub trait TelemetrySource: Send + Sync + 'static {
    /// Fetches the data needed by the fast loop.
    fn fetch_raw(&self) -> impl Future<Output = Result<DeviceSnapshot>> + Send;

    /// Fetches everything, including the production summary.
    fn fetch_full(&self) -> impl Future<Output = Result<DeviceSnapshot>> + Send;
}

/// Scripted [`TelemetrySource`] for tests.
///
/// Each cadence has its own script. Entries are served in order and the last
/// one repeats; a `None` entry fails that fetch with a transport error.
#[derive(Debug, Default)]
pub struct FakeTelemetrySource {
    raw: Mutex<VecDeque<Option<DeviceSnapshot>>>,
    full: Mutex<VecDeque<Option<DeviceSnapshot>>>,
    raw_calls: AtomicUsize,
    full_calls: AtomicUsize,
    latency: Option<Duration>,
}

impl FakeTelemetrySource {
    /// Creates a source with empty scripts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a raw snapshot to the script.
    #[must_use]
    pub fn with_raw(self, snapshot: DeviceSnapshot) -> Self {
        self.raw.lock().push_back(Some(snapshot));
        self
    }

    /// Appends a failing raw fetch to the script.
    #[must_use]
    pub fn with_raw_failure(self) -> Self {
        self.raw.lock().push_back(None);
        self
    }

    /// Appends a full snapshot to the script.
    #[must_use]
    pub fn with_full(self, snapshot: DeviceSnapshot) -> Self {
        self.full.lock().push_back(Some(snapshot));
        self
    }

    /// Appends a failing full fetch to the script.
    #[must_use]
    pub fn with_full_failure(self) -> Self {
        self.full.lock().push_back(None);
        self
    }

    /// Delays every fetch.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Appends a full snapshot to a running script.
    pub fn push_full(&self, snapshot: DeviceSnapshot) {
        self.full.lock().push_back(Some(snapshot));
    }

    /// Number of raw fetches so far.
    #[must_use]
    pub fn raw_calls(&self) -> usize {
        self.raw_calls.load(Ordering::SeqCst)
    }

    /// Number of full fetches so far.
    #[must_use]
    pub fn full_calls(&self) -> usize {
        self.full_calls.load(Ordering::SeqCst)
    }

    async fn serve(
        &self,
        script: &Mutex<VecDeque<Option<DeviceSnapshot>>>,
        calls: &AtomicUsize,
        endpoint: &str,
    ) -> Result<DeviceSnapshot> {
        calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let next = {
            let mut script = script.lock();
            if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            }
        };

        next.flatten().ok_or_else(|| ClientError::Transport {
            endpoint: endpoint.to_string(),
            reason: "scripted failure".to_string(),
        })
    }
}

impl TelemetrySource for FakeTelemetrySource {
    async fn fetch_raw(&self) -> Result<DeviceSnapshot> {
        self.serve(&self.raw, &self.raw_calls, "raw").await
    }

    async fn fetch_full(&self) -> Result<DeviceSnapshot> {
        self.serve(&self.full, &self.full_calls, "full").await
    }
}
