//! Metric transformation and daily-delta tracking for Enphase Envoy telemetry.
#![forbid(unsafe_code)]
//!
//! `envoy-metrics` holds the pure, transport-free half of the bridge:
//!
//! - **Transformation**: raw gateway payloads ([`DeviceSnapshot`]) become
//!   canonical metric sets via [`MetricTransformer`]
//! - **Daily deltas**: the [`ReferenceStore`] keeps one midnight reference per
//!   lifetime counter and derives `*_today` values from it
//! - **Rollover**: once per calendar day, shortly after local midnight, the
//!   previous day is archived and the references advance
//!
//! # Example
//!
//! ```rust
//! use envoy_metrics::{CanonicalMetricSet, ReferenceConfig, ReferenceStore};
//!
//! let store = ReferenceStore::new(ReferenceConfig::default()).unwrap();
//!
//! let mut current = CanonicalMetricSet::new();
//! current.insert("prod_eim_whLifetime".to_string(), 500.0);
//! store.seed_missing(&current);
//!
//! current.insert("prod_eim_whLifetime".to_string(), 730.0);
//! let daily = store.compute_daily(&current);
//! assert_eq!(daily["prod_eim_today"], 230.0);
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod error;
pub mod reference;
pub mod transform;
pub mod types;

pub use error::{MetricsError, Result};
pub use reference::{
    daily_delta, Reference, ReferenceConfig, ReferenceStore, ReferenceUpdate, Rollover,
    DEFAULT_ROLLOVER_WINDOW, DEFAULT_TRACKED_SENSORS,
};
pub use transform::MetricTransformer;
pub use types::{
    format_value, numeric_fields, CanonicalMetricSet, DeviceSnapshot, RawMetricSet, Retained,
    ROLLOVER_DATE_KEY,
};
