//! Midnight-reference tracking.
//!
//! The [`ReferenceStore`] turns monotonically increasing lifetime counters into
//! per-calendar-day deltas. For every tracked sensor it keeps the counter value
//! recorded at the last local midnight (or at first observation), mirrors that
//! value to the retained sink for durability, and recovers it from the same
//! retained keys on startup.
//!
//! Reference lifecycle: `Unset` → `Seeded` (first observation) → `Active`
//! (used for delta math, or recovered from the retained sink). A rollover
//! overwrites the value in place and leaves the reference `Active`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{MetricsError, Result};
use crate::transform::MetricTransformer;
use crate::types::{
    daily_name, reference_key, yesterday_name, CanonicalMetricSet, Retained, LIFETIME_SUFFIX,
    REFERENCE_SUFFIX, ROLLOVER_DATE_KEY,
};

/// Lifetime counters tracked for daily deltas by default.
pub const DEFAULT_TRACKED_SENSORS: &[&str] = &[
    "conso_all_eim_whLifetime",
    "conso_net_eim_whLifetime",
    "prod_eim_whLifetime",
    "grid_eim_whLifetime",
    "eco_eim_whLifetime",
    "import_eim_whLifetime",
];

/// Default length of the early-morning rollover window.
pub const DEFAULT_ROLLOVER_WINDOW: Duration = Duration::from_secs(5 * 60);

/// State of a single sensor's midnight reference.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Reference {
    /// No value known yet.
    #[default]
    Unset,
    /// Set from the first observed lifetime value.
    Seeded(f64),
    /// Used for daily-delta math.
    Active(f64),
}

impl Reference {
    /// Returns the recorded lifetime value, if any.
    #[must_use]
    pub const fn value(&self) -> Option<f64> {
        match self {
            Self::Unset => None,
            Self::Seeded(v) | Self::Active(v) => Some(*v),
        }
    }

    /// Returns true if no value is known.
    #[must_use]
    pub const fn is_unset(&self) -> bool {
        matches!(self, Self::Unset)
    }
}

/// An inbound retained message relevant to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceUpdate {
    /// Field key relative to the device's data namespace.
    pub key: String,
    /// Raw payload text.
    pub payload: String,
}

impl ReferenceUpdate {
    /// Creates a new update.
    #[must_use]
    pub fn new(key: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            payload: payload.into(),
        }
    }
}

/// Configuration for the reference store.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceConfig {
    /// Lifetime sensors tracked for daily deltas.
    pub tracked: Vec<String>,
    /// How long after local midnight a rollover may fire.
    pub rollover_window: Duration,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            tracked: DEFAULT_TRACKED_SENSORS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            rollover_window: DEFAULT_ROLLOVER_WINDOW,
        }
    }
}

impl ReferenceConfig {
    /// Set the rollover window.
    #[must_use]
    pub const fn with_rollover_window(mut self, window: Duration) -> Self {
        self.rollover_window = window;
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a tracked name is not a lifetime Wh counter.
    pub fn validate(&self) -> Result<()> {
        for name in &self.tracked {
            if !name.ends_with(LIFETIME_SUFFIX) {
                return Err(MetricsError::InvalidSensor {
                    name: name.clone(),
                    reason: format!("must end with '{LIFETIME_SUFFIX}'"),
                });
            }
        }
        Ok(())
    }
}

/// Outcome of a midnight rollover.
#[derive(Debug, Clone, PartialEq)]
pub struct Rollover {
    /// The calendar date the rollover was recorded for.
    pub date: NaiveDate,
    /// Archived daily deltas, keyed by their "yesterday" name.
    pub yesterday: CanonicalMetricSet,
    /// Values to mirror on the retained sink, in emission order.
    pub retained: Vec<Retained>,
}

/// Thread-safe owner of all midnight references.
///
/// Updates are atomic per sensor; there is no cross-sensor transaction.
#[derive(Debug)]
pub struct ReferenceStore {
    config: ReferenceConfig,
    references: RwLock<HashMap<String, Reference>>,
    yesterday: RwLock<CanonicalMetricSet>,
    last_rollover: RwLock<Option<NaiveDate>>,
}

impl ReferenceStore {
    /// Creates a store with every tracked reference `Unset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: ReferenceConfig) -> Result<Self> {
        config.validate()?;
        let references = config
            .tracked
            .iter()
            .map(|name| (name.clone(), Reference::Unset))
            .collect();
        Ok(Self {
            config,
            references: RwLock::new(references),
            yesterday: RwLock::new(CanonicalMetricSet::new()),
            last_rollover: RwLock::new(None),
        })
    }

    /// Returns the tracked sensor names.
    #[must_use]
    pub fn tracked(&self) -> &[String] {
        &self.config.tracked
    }

    /// Returns every retained key the store recovers state from.
    #[must_use]
    pub fn subscription_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.config.tracked.iter().map(|s| reference_key(s)).collect();
        keys.push(ROLLOVER_DATE_KEY.to_string());
        keys
    }

    /// Returns the current reference of a sensor (`Unset` if untracked).
    #[must_use]
    pub fn reference(&self, sensor: &str) -> Reference {
        self.references.read().get(sensor).copied().unwrap_or_default()
    }

    /// Returns the date of the last recorded rollover.
    #[must_use]
    pub fn last_rollover(&self) -> Option<NaiveDate> {
        *self.last_rollover.read()
    }

    /// Returns the archived deltas of the previous day.
    #[must_use]
    pub fn yesterday(&self) -> CanonicalMetricSet {
        self.yesterday.read().clone()
    }

    /// Applies an inbound retained value.
    ///
    /// An empty payload (a cleared retained message) resets the reference to
    /// `Unset`, so it is re-seeded on the next cycle. Returns `false` if the key
    /// is not one the store tracks.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be parsed.
    pub fn apply_update(&self, update: &ReferenceUpdate) -> Result<bool> {
        let payload = update.payload.trim();

        if update.key == ROLLOVER_DATE_KEY {
            if payload.is_empty() {
                *self.last_rollover.write() = None;
                return Ok(true);
            }
            let date: NaiveDate = payload.parse().map_err(|_| invalid(update))?;
            *self.last_rollover.write() = Some(date);
            debug!(%date, "recovered last rollover date");
            return Ok(true);
        }

        let Some(sensor) = update.key.strip_suffix(REFERENCE_SUFFIX) else {
            return Ok(false);
        };
        if !self.config.tracked.iter().any(|t| t == sensor) {
            return Ok(false);
        }

        if payload.is_empty() {
            self.references
                .write()
                .insert(sensor.to_string(), Reference::Unset);
            info!(sensor, "reference cleared externally");
            return Ok(true);
        }

        let value: f64 = payload.parse().map_err(|_| invalid(update))?;
        if !value.is_finite() {
            return Err(invalid(update));
        }
        self.references
            .write()
            .insert(sensor.to_string(), Reference::Active(value));
        info!(sensor, value, "reference updated from retained value");
        Ok(true)
    }

    /// Spawns a task applying retained updates for as long as the feed is open.
    pub fn spawn_listener(
        self: &Arc<Self>,
        mut updates: mpsc::Receiver<ReferenceUpdate>,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(update) = updates.recv().await {
                if let Err(e) = store.apply_update(&update) {
                    warn!(error = %e, "ignoring retained reference update");
                }
            }
            debug!("reference feed closed");
        })
    }

    /// Starts the listener and waits out the grace window.
    ///
    /// Retained values delivered within `grace` are in place before this
    /// returns. The listener keeps running; abort the returned handle to stop it.
    pub async fn bootstrap(
        self: &Arc<Self>,
        updates: mpsc::Receiver<ReferenceUpdate>,
        grace: Duration,
    ) -> JoinHandle<()> {
        let handle = self.spawn_listener(updates);
        tokio::time::sleep(grace).await;

        let recovered = self
            .references
            .read()
            .values()
            .filter(|r| !r.is_unset())
            .count();
        info!(
            recovered,
            tracked = self.config.tracked.len(),
            grace_ms = grace.as_millis(),
            "reference bootstrap window elapsed"
        );
        handle
    }

    /// Seeds every `Unset` reference whose sensor is present in `current`.
    ///
    /// Existing references are never overwritten. Returns the seeded values for
    /// the retained sink.
    pub fn seed_missing(&self, current: &CanonicalMetricSet) -> Vec<Retained> {
        let mut seeded = Vec::new();
        let mut references = self.references.write();

        for sensor in &self.config.tracked {
            let Some(&value) = current.get(sensor) else {
                continue;
            };
            let entry = references.entry(sensor.clone()).or_default();
            if entry.is_unset() {
                *entry = Reference::Seeded(value);
                info!(sensor = %sensor, value, "seeded new midnight reference");
                seeded.push(Retained::number(reference_key(sensor), value));
            }
        }

        seeded
    }

    /// Computes today's deltas against the current references.
    ///
    /// Each delta is `max(0, round(current - reference))`. Sensors without a
    /// reference or absent from `current` are skipped.
    pub fn compute_daily(&self, current: &CanonicalMetricSet) -> CanonicalMetricSet {
        let mut daily = CanonicalMetricSet::new();
        let mut references = self.references.write();

        for sensor in &self.config.tracked {
            let Some(&value) = current.get(sensor) else {
                continue;
            };
            let Some(entry) = references.get_mut(sensor) else {
                continue;
            };
            let Some(reference) = entry.value() else {
                continue;
            };
            *entry = Reference::Active(reference);

            let delta = daily_delta(value, reference);
            debug!(sensor = %sensor, delta, current = value, reference, "daily delta");
            daily.insert(daily_name(sensor), delta);
        }
        drop(references);

        MetricTransformer::combine_daily(&mut daily);
        daily
    }

    /// Fires the midnight rollover if `now` is inside the window and no
    /// rollover has been recorded for today yet.
    ///
    /// Yesterday's deltas are computed from the pre-rollover references before
    /// those are overwritten with the current lifetime values.
    pub fn check_midnight_rollover(
        &self,
        now: NaiveDateTime,
        current: &CanonicalMetricSet,
    ) -> Option<Rollover> {
        if !self.in_rollover_window(now) {
            return None;
        }

        let today = now.date();
        // Held for the whole rollover so concurrent callers cannot fire twice.
        let mut last_rollover = self.last_rollover.write();
        if last_rollover.is_some_and(|last| last >= today) {
            return None;
        }

        info!(%today, "midnight rollover");
        let mut retained = Vec::new();

        let daily = self.compute_daily(current);
        let mut yesterday = CanonicalMetricSet::new();
        for (name, value) in &daily {
            let archived = yesterday_name(name);
            info!(field = %archived, value, "archived previous day");
            retained.push(Retained::number(archived.clone(), *value));
            yesterday.insert(archived, *value);
        }
        *self.yesterday.write() = yesterday.clone();

        {
            let mut references = self.references.write();
            for sensor in &self.config.tracked {
                if let Some(&value) = current.get(sensor) {
                    references.insert(sensor.clone(), Reference::Active(value));
                    info!(sensor = %sensor, value, "new midnight reference");
                    retained.push(Retained::number(reference_key(sensor), value));
                }
            }
        }

        *last_rollover = Some(today);
        retained.push(Retained {
            key: ROLLOVER_DATE_KEY.to_string(),
            payload: today.to_string(),
        });

        Some(Rollover {
            date: today,
            yesterday,
            retained,
        })
    }

    fn in_rollover_window(&self, now: NaiveDateTime) -> bool {
        let since_midnight = now.time().signed_duration_since(NaiveTime::MIN);
        since_midnight
            .to_std()
            .is_ok_and(|elapsed| elapsed <= self.config.rollover_window)
    }
}

/// Non-negative, rounded difference between a lifetime value and its reference.
#[must_use]
pub fn daily_delta(current: f64, reference: f64) -> f64 {
    let delta = (current - reference).round_ties_even();
    if delta > 0.0 { delta } else { 0.0 }
}

fn invalid(update: &ReferenceUpdate) -> MetricsError {
    MetricsError::InvalidReference {
        key: update.key.clone(),
        payload: update.payload.clone(),
    }
}
