//! Core types for Envoy telemetry.
//!
//! - [`RawMetricSet`]: device-native field names to numeric values
//! - [`DeviceSnapshot`]: one poll cycle's raw payloads, grouped by category
//! - [`CanonicalMetricSet`]: canonical metric names to values
//! - [`Retained`]: a value that must be mirrored to the retained sink

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Suffix carried by every lifetime Wh counter.
pub const LIFETIME_SUFFIX: &str = "_whLifetime";

/// Suffix of the per-day delta derived from a lifetime counter.
pub const DAILY_SUFFIX: &str = "_today";

/// Suffix of the frozen previous-day delta.
pub const YESTERDAY_SUFFIX: &str = "_yesterday";

/// Suffix of the retained midnight reference value.
pub const REFERENCE_SUFFIX: &str = "_00h";

/// Retained key holding the date of the last midnight rollover.
pub const ROLLOVER_DATE_KEY: &str = "midnight_rollover_date";

/// Mapping from device-native field name to numeric value.
pub type RawMetricSet = BTreeMap<String, f64>;

/// Mapping from canonical metric name to numeric value.
pub type CanonicalMetricSet = BTreeMap<String, f64>;

/// Raw payloads collected from the gateway during one poll cycle.
///
/// Categories the device did not report are left empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    /// Reading of the meter whose measurement type is `production`.
    pub production_meter: RawMetricSet,
    /// Reading of the meter whose measurement type is `net-consumption`.
    pub net_consumption_meter: RawMetricSet,
    /// Cumulative block of the `total-consumption` report.
    pub total_consumption: RawMetricSet,
    /// Cumulative block of the `net-consumption` report.
    pub net_consumption: RawMetricSet,
    /// Production summary (`/api/v1/production`).
    pub production_summary: RawMetricSet,
    /// When the snapshot was captured.
    pub captured_at: DateTime<Utc>,
}

impl DeviceSnapshot {
    /// Creates an empty snapshot stamped with the current time.
    #[must_use]
    pub fn now() -> Self {
        Self {
            captured_at: Utc::now(),
            ..Self::default()
        }
    }
}

/// A key/payload pair destined for the retained sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retained {
    /// Field key, relative to the device's data namespace.
    pub key: String,
    /// Rendered payload.
    pub payload: String,
}

impl Retained {
    /// Creates a retained numeric value.
    #[must_use]
    pub fn number(key: impl Into<String>, value: f64) -> Self {
        Self {
            key: key.into(),
            payload: format_value(value),
        }
    }
}

/// Extracts the numeric fields of a JSON object.
///
/// Booleans, strings, nulls and nested values are skipped.
#[must_use]
pub fn numeric_fields(object: &Map<String, Value>) -> RawMetricSet {
    object
        .iter()
        .filter_map(|(key, value)| match value {
            Value::Number(n) => n.as_f64().map(|v| (key.clone(), v)),
            _ => None,
        })
        .collect()
}

/// Returns the daily metric name for a lifetime sensor.
#[must_use]
pub fn daily_name(sensor: &str) -> String {
    sensor.replace(LIFETIME_SUFFIX, DAILY_SUFFIX)
}

/// Returns the archived ("yesterday") name for a daily metric.
#[must_use]
pub fn yesterday_name(daily: &str) -> String {
    daily.replace(DAILY_SUFFIX, YESTERDAY_SUFFIX)
}

/// Returns the retained key under which a sensor's reference is mirrored.
#[must_use]
pub fn reference_key(sensor: &str) -> String {
    format!("{sensor}{REFERENCE_SUFFIX}")
}

/// Rounds to a fixed number of decimal places.
#[must_use]
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10_f64.powi(decimals);
    (value * factor).round() / factor
}

/// Renders a metric value for publication.
///
/// Integral values have no fractional part (`1500`, not `1500.0`).
#[must_use]
pub fn format_value(value: f64) -> String {
    // Normalise negative zero so clamped deltas never render as "-0".
    let value = if value == 0.0 { 0.0 } else { value };
    value.to_string()
}
