//! envoy-bridge - Enphase Envoy to MQTT bridge
//!
//! Polls an Envoy gateway on two cadences and republishes its telemetry to an
//! MQTT broker:
//!
//! - the fast loop publishes instantaneous demands to `<base>/<serial>/raw/*`
//! - the slow loop publishes every field, daily energy deltas and the
//!   midnight references to `<base>/<serial>/data/*`, retained
//! - liveness goes to `<base>/<serial>/lwt`, with `offline` as last will
//!
//! Midnight references are recovered from the broker's retained messages at
//! startup, so daily totals survive restarts.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod mqtt;
pub mod publisher;
pub mod reconnect;
pub mod scheduler;
pub mod service;
pub mod status;
pub mod summary;
pub mod topics;

pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use mqtt::{MqttConnection, MqttPublisher};
pub use publisher::{Published, Publisher, RecordingPublisher};
pub use scheduler::{CycleReport, Intervals, Scheduler, ShutdownRx, ShutdownTx};
pub use service::{check_auth, run_service, Bridge};
pub use status::{Liveness, StatusReporter};
pub use summary::SummaryConfig;
pub use topics::TopicLayout;
