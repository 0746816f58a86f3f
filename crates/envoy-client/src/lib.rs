//! Authenticated client for the Enphase Envoy local gateway.
#![forbid(unsafe_code)]
//!
//! - [`SessionManager`] runs the cloud login, token exchange and local
//!   validation handshake, keeps the bearer token fresh and retries once on 401
//! - [`EnvoyApi`] reads meters, readings, consumption reports and the
//!   production summary, and assembles them into device snapshots
//! - [`TelemetrySource`] is the seam the scheduler polls through
//!
//! All network access goes through [`HttpBackend`]; [`ReqwestBackend`] is the
//! production implementation and [`FakeBackend`] serves scripted responses.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod api;
pub mod error;
pub mod http;
pub mod session;
pub mod source;

pub use api::{ConsumptionReports, EnvoyApi, MeterReadings, MeterRole};
pub use error::{ClientError, Result};
pub use http::{FakeBackend, HttpBackend, HttpResponse, RecordedRequest, ReqwestBackend};
pub use session::{Credentials, Session, SessionConfig, SessionManager};
pub use source::{FakeTelemetrySource, TelemetrySource};
