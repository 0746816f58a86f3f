//! The fast and slow polling loops.
//!
//! Each loop runs one cycle, measures how long it took and sleeps for the rest
//! of its interval. A cycle that overruns its interval logs a drift warning and
//! the next cycle starts immediately; there is no catch-up. A failed cycle is
//! logged and followed by a full-interval sleep. Loops stop only on shutdown,
//! and never in the middle of a cycle.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use envoy_client::TelemetrySource;
use envoy_metrics::{format_value, CanonicalMetricSet, MetricTransformer, ReferenceStore, Retained};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::publisher::Publisher;
use crate::summary::{NetConsumptionSummary, PvProductionSummary, SummaryConfig};
use crate::topics::TopicLayout;

/// Receiver for the shutdown signal.
pub type ShutdownRx = broadcast::Receiver<()>;

/// Sender for the shutdown signal.
pub type ShutdownTx = broadcast::Sender<()>;

/// Source of local wall-clock time, used for midnight detection.
pub type Clock = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;

/// Loop cadences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Intervals {
    /// Fast loop interval; `None` disables the loop.
    pub raw: Option<Duration>,
    /// Slow loop interval.
    pub full: Duration,
}

/// Which loop a cycle belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    /// Instantaneous demands, not retained.
    Raw,
    /// All fields plus daily deltas, retained.
    Full,
}

impl LoopKind {
    const fn name(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Full => "full",
        }
    }
}

/// Result of a successful cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Messages handed to the publisher.
    pub published: usize,
    /// Whether the midnight rollover fired during this cycle.
    pub rolled_over: bool,
}

/// How long to wait before the next cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// The cycle fit in its interval; sleep for the remainder.
    Sleep(Duration),
    /// The cycle overran its interval by `overrun`; start the next one now.
    Drift {
        /// Time spent beyond the interval.
        overrun: Duration,
    },
}

impl Pacing {
    /// Delay before the next cycle.
    #[must_use]
    pub const fn delay(self) -> Duration {
        match self {
            Self::Sleep(delay) => delay,
            Self::Drift { .. } => Duration::ZERO,
        }
    }
}

/// Computes the pacing for a cycle that took `elapsed` out of `interval`.
#[must_use]
pub fn pace(interval: Duration, elapsed: Duration) -> Pacing {
    if elapsed > interval {
        Pacing::Drift {
            overrun: elapsed - interval,
        }
    } else {
        Pacing::Sleep(interval - elapsed)
    }
}

/// Drives the fast and slow loops.
pub struct Scheduler<S, P> {
    source: Arc<S>,
    publisher: Arc<P>,
    store: Arc<ReferenceStore>,
    layout: TopicLayout,
    intervals: Intervals,
    summaries: SummaryConfig,
    clock: Clock,
}

impl<S, P> fmt::Debug for Scheduler<S, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("layout", &self.layout)
            .field("intervals", &self.intervals)
            .field("summaries", &self.summaries)
            .finish_non_exhaustive()
    }
}

impl<S: TelemetrySource, P: Publisher> Scheduler<S, P> {
    /// Creates a scheduler using the local system clock.
    #[must_use]
    pub fn new(
        source: Arc<S>,
        publisher: Arc<P>,
        store: Arc<ReferenceStore>,
        layout: TopicLayout,
        intervals: Intervals,
    ) -> Self {
        Self {
            source,
            publisher,
            store,
            layout,
            intervals,
            summaries: SummaryConfig::default(),
            clock: Arc::new(|| Local::now().naive_local()),
        }
    }

    /// Enables the aggregated summary topics.
    #[must_use]
    pub fn with_summaries(mut self, summaries: SummaryConfig) -> Self {
        self.summaries = summaries;
        self
    }

    /// Replaces the wall clock.
    #[must_use]
    pub fn with_clock(mut self, clock: impl Fn() -> NaiveDateTime + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Returns the loop cadences.
    #[must_use]
    pub const fn intervals(&self) -> Intervals {
        self.intervals
    }

    /// One fast-loop cycle: fetch, transform, publish each field non-retained.
    ///
    /// # Errors
    ///
    /// Returns the fetch or publish error.
    pub async fn raw_cycle(&self) -> Result<CycleReport> {
        let snapshot = self.source.fetch_raw().await?;
        let metrics = MetricTransformer::transform_raw(&snapshot);

        for (name, value) in &metrics {
            self.publisher
                .publish(&self.layout.raw(name), format_value(*value), false)
                .await?;
        }

        Ok(CycleReport {
            published: metrics.len(),
            rolled_over: false,
        })
    }

    /// One slow-loop cycle.
    ///
    /// Fetches everything, seeds missing references, checks for the midnight
    /// rollover, computes daily deltas, then publishes reference state and all
    /// fields retained. Daily deltas replace same-named device fields.
    ///
    /// # Errors
    ///
    /// Returns the fetch or publish error.
    pub async fn full_cycle(&self) -> Result<CycleReport> {
        let snapshot = self.source.fetch_full().await?;
        let current = MetricTransformer::transform_full(&snapshot);

        let mut retained = self.store.seed_missing(&current);
        let rollover = self.store.check_midnight_rollover((self.clock)(), &current);
        let rolled_over = rollover.is_some();
        if let Some(rollover) = rollover {
            info!(date = %rollover.date, archived = rollover.yesterday.len(), "daily totals rolled over");
            retained.extend(rollover.retained);
        }
        let daily = self.store.compute_daily(&current);

        let mut published = self.publish_retained(&retained).await?;

        let mut fields: CanonicalMetricSet = current.clone();
        fields.extend(daily);
        for (name, value) in &fields {
            self.publisher
                .publish(&self.layout.data(name), format_value(*value), true)
                .await?;
        }
        published += fields.len();

        published += self.publish_summaries(&current).await?;

        debug!(published, rolled_over, "full cycle complete");
        Ok(CycleReport {
            published,
            rolled_over,
        })
    }

    async fn publish_retained(&self, retained: &[Retained]) -> Result<usize> {
        for value in retained {
            self.publisher
                .publish(&self.layout.data(&value.key), value.payload.clone(), true)
                .await?;
        }
        Ok(retained.len())
    }

    async fn publish_summaries(&self, metrics: &CanonicalMetricSet) -> Result<usize> {
        let mut published = 0;
        if let Some(topic) = &self.summaries.pv_production_topic {
            let payload = serde_json::to_string(&PvProductionSummary::from_metrics(metrics))?;
            self.publisher.publish(topic, payload, true).await?;
            published += 1;
        }
        if let Some(topic) = &self.summaries.net_consumption_topic {
            let payload = serde_json::to_string(&NetConsumptionSummary::from_metrics(metrics))?;
            self.publisher.publish(topic, payload, true).await?;
            published += 1;
        }
        Ok(published)
    }

    /// Spawns the enabled loops. Each stops after its current cycle once
    /// `shutdown` fires.
    pub fn spawn(self: &Arc<Self>, shutdown: &ShutdownTx) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(2);

        match self.intervals.raw {
            Some(interval) => {
                let this = Arc::clone(self);
                let rx = shutdown.subscribe();
                handles.push(tokio::spawn(this.run_loop(LoopKind::Raw, interval, rx)));
            }
            None => info!("raw loop disabled"),
        }

        let this = Arc::clone(self);
        let rx = shutdown.subscribe();
        handles.push(tokio::spawn(this.run_loop(LoopKind::Full, self.intervals.full, rx)));

        handles
    }

    /// Runs one loop until shutdown.
    pub async fn run_loop(self: Arc<Self>, kind: LoopKind, interval: Duration, mut shutdown: ShutdownRx) {
        let name = kind.name();
        info!(cadence = name, interval_ms = interval.as_millis(), "loop started");

        loop {
            let started = Instant::now();
            let outcome = match kind {
                LoopKind::Raw => self.raw_cycle().await,
                LoopKind::Full => self.full_cycle().await,
            };

            let delay = match outcome {
                Ok(report) => {
                    debug!(cadence = name, published = report.published, "cycle succeeded");
                    match pace(interval, started.elapsed()) {
                        Pacing::Sleep(delay) => delay,
                        Pacing::Drift { overrun } => {
                            warn!(
                                cadence = name,
                                overrun_ms = overrun.as_millis(),
                                "cycle overran its interval"
                            );
                            Duration::ZERO
                        }
                    }
                }
                Err(e) => {
                    error!(cadence = name, error = %e, "cycle failed, backing off");
                    interval
                }
            };

            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        info!(cadence = name, "loop stopped");
    }
}
