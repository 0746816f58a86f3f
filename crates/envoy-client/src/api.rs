//! Typed access to the gateway's telemetry endpoints.

use std::collections::HashMap;
use std::sync::Arc;

use envoy_metrics::{numeric_fields, DeviceSnapshot, RawMetricSet};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{ClientError, Result};
use crate::http::HttpBackend;
use crate::session::SessionManager;
use crate::source::TelemetrySource;

/// Meter configuration list.
pub const METERS_PATH: &str = "/ivp/meters";
/// Instantaneous meter readings.
pub const READINGS_PATH: &str = "/ivp/meters/readings";
/// Consumption reports.
pub const REPORTS_PATH: &str = "/ivp/meters/reports/consumption";
/// Production summary.
pub const PRODUCTION_PATH: &str = "/api/v1/production";

/// Role of a metering channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeterRole {
    /// Measures solar production.
    Production,
    /// Measures net flow at the grid connection.
    NetConsumption,
}

impl MeterRole {
    /// Maps a gateway `measurementType`, ignoring case.
    #[must_use]
    pub fn from_measurement_type(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("production") {
            Some(Self::Production)
        } else if value.eq_ignore_ascii_case("net-consumption") {
            Some(Self::NetConsumption)
        } else {
            None
        }
    }
}

/// Meter readings keyed by role.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeterReadings {
    /// Reading of the production meter.
    pub production: RawMetricSet,
    /// Reading of the net-consumption meter.
    pub net_consumption: RawMetricSet,
}

/// Cumulative blocks of the consumption reports.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsumptionReports {
    /// `total-consumption` report.
    pub total: RawMetricSet,
    /// `net-consumption` report.
    pub net: RawMetricSet,
}

/// Gateway telemetry API over an authenticated session.
#[derive(Debug)]
pub struct EnvoyApi<B> {
    session: Arc<SessionManager<B>>,
    meters: RwLock<Option<HashMap<u64, MeterRole>>>,
}

impl<B: HttpBackend> EnvoyApi<B> {
    /// Creates an API client sharing `session`.
    #[must_use]
    pub fn new(session: Arc<SessionManager<B>>) -> Self {
        Self {
            session,
            meters: RwLock::new(None),
        }
    }

    /// Returns the underlying session manager.
    #[must_use]
    pub fn session(&self) -> &Arc<SessionManager<B>> {
        &self.session
    }

    /// Drops the cached meter configuration.
    pub fn clear_cache(&self) {
        *self.meters.write() = None;
        debug!("meter configuration cache cleared");
    }

    /// Returns the meter eid → role mapping, fetching it once.
    ///
    /// An empty mapping is not cached, so a gateway that has not finished
    /// booting is asked again next time.
    ///
    /// # Errors
    ///
    /// Returns the request error, or a parse error if the list is malformed.
    pub async fn meters(&self) -> Result<HashMap<u64, MeterRole>> {
        let cached = self.meters.read().clone();
        if let Some(cached) = cached {
            return Ok(cached);
        }

        let value = self.session.request(METERS_PATH).await?;
        let mapping: HashMap<u64, MeterRole> = array(METERS_PATH, &value)?
            .iter()
            .filter_map(|meter| {
                let eid = meter.get("eid")?.as_u64()?;
                let role = MeterRole::from_measurement_type(meter.get("measurementType")?.as_str()?)?;
                Some((eid, role))
            })
            .collect();

        if !mapping.is_empty() {
            info!(meters = mapping.len(), "meter configuration loaded");
            *self.meters.write() = Some(mapping.clone());
        }
        Ok(mapping)
    }

    /// Fetches instantaneous readings for the production and net meters.
    ///
    /// Readings from meters with unknown eids are ignored.
    ///
    /// # Errors
    ///
    /// Returns the request error, or a parse error if the payload is malformed.
    pub async fn meter_readings(&self) -> Result<MeterReadings> {
        let meters = self.meters().await?;
        let mut readings = MeterReadings::default();
        if meters.is_empty() {
            return Ok(readings);
        }

        let value = self.session.request(READINGS_PATH).await?;
        for reading in array(READINGS_PATH, &value)? {
            let Some(object) = reading.as_object() else {
                continue;
            };
            let Some(role) = object
                .get("eid")
                .and_then(Value::as_u64)
                .and_then(|eid| meters.get(&eid))
            else {
                continue;
            };
            let fields = numeric_fields(object);
            match role {
                MeterRole::Production => readings.production = fields,
                MeterRole::NetConsumption => readings.net_consumption = fields,
            }
        }
        Ok(readings)
    }

    /// Fetches the cumulative consumption reports.
    ///
    /// # Errors
    ///
    /// Returns the request error, or a parse error if the payload is malformed.
    pub async fn consumption_reports(&self) -> Result<ConsumptionReports> {
        let value = self.session.request(REPORTS_PATH).await?;
        let mut reports = ConsumptionReports::default();

        for report in array(REPORTS_PATH, &value)? {
            let Some(cumulative) = report.get("cumulative").and_then(Value::as_object) else {
                continue;
            };
            match report.get("reportType").and_then(Value::as_str) {
                Some("total-consumption") => reports.total = numeric_fields(cumulative),
                Some("net-consumption") => reports.net = numeric_fields(cumulative),
                _ => {}
            }
        }
        Ok(reports)
    }

    /// Fetches the production summary.
    ///
    /// # Errors
    ///
    /// Returns the request error, or a parse error if the payload is not an object.
    pub async fn production_summary(&self) -> Result<RawMetricSet> {
        let value = self.session.request(PRODUCTION_PATH).await?;
        let object = value
            .as_object()
            .ok_or_else(|| ClientError::parse(PRODUCTION_PATH, "expected a JSON object", &value.to_string()))?;
        Ok(numeric_fields(object))
    }
}

impl<B: HttpBackend> TelemetrySource for EnvoyApi<B> {
    async fn fetch_raw(&self) -> Result<DeviceSnapshot> {
        let (readings, reports) = tokio::try_join!(self.meter_readings(), self.consumption_reports())?;
        Ok(snapshot(readings, reports, RawMetricSet::new()))
    }

    async fn fetch_full(&self) -> Result<DeviceSnapshot> {
        let (readings, reports, summary) = tokio::try_join!(
            self.meter_readings(),
            self.consumption_reports(),
            self.production_summary()
        )?;
        Ok(snapshot(readings, reports, summary))
    }
}

fn snapshot(readings: MeterReadings, reports: ConsumptionReports, summary: RawMetricSet) -> DeviceSnapshot {
    DeviceSnapshot {
        production_meter: readings.production,
        net_consumption_meter: readings.net_consumption,
        total_consumption: reports.total,
        net_consumption: reports.net,
        production_summary: summary,
        ..DeviceSnapshot::now()
    }
}

fn array<'a>(endpoint: &str, value: &'a Value) -> Result<&'a Vec<Value>> {
    value
        .as_array()
        .ok_or_else(|| ClientError::parse(endpoint, "expected a JSON array", &value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{FakeBackend, HttpResponse};
    use crate::session::{Credentials, Session, SessionConfig};
    use chrono::{TimeDelta, Utc};
    use serde_json::json;
    use test_case::test_case;

    const TOKEN: &str = "eyJhbGciOiJFUzI1NiJ9.live-token";

    fn meters_body() -> Value {
        json!([
            {"eid": 704643328, "state": "enabled", "measurementType": "production"},
            {"eid": 704643584, "state": "enabled", "measurementType": "Net-Consumption"},
            {"eid": 704643840, "state": "disabled", "measurementType": "storage"},
        ])
    }

    fn readings_body() -> Value {
        json!([
            {"eid": 704643328, "timestamp": 1717243200, "actEnergyDlvd": 1234567.0, "instantaneousDemand": 900.0},
            {"eid": 704643584, "timestamp": 1717243200, "actEnergyDlvd": 250500.0, "actEnergyRcvd": 400000.0, "instantaneousDemand": -150.0},
            {"eid": 999, "instantaneousDemand": 1.0},
        ])
    }

    fn reports_body() -> Value {
        json!([
            {"reportType": "total-consumption", "cumulative": {"currW": 750.0, "whDlvdCum": 2000000.0, "flags": "x"}},
            {"reportType": "net-consumption", "cumulative": {"currW": -150.0, "whDlvdCum": 765433.0}},
            {"reportType": "production", "cumulative": {"currW": 900.0}},
        ])
    }

    fn backend() -> FakeBackend {
        FakeBackend::new()
            .with_response(METERS_PATH, HttpResponse::json(200, &meters_body()))
            .with_response(READINGS_PATH, HttpResponse::json(200, &readings_body()))
            .with_response(REPORTS_PATH, HttpResponse::json(200, &reports_body()))
            .with_response(
                PRODUCTION_PATH,
                HttpResponse::json(200, &json!({"wattHoursToday": 4100, "wattsNow": 880, "label": "x"})),
            )
    }

    fn api(backend: FakeBackend) -> (Arc<FakeBackend>, EnvoyApi<FakeBackend>) {
        let backend = Arc::new(backend);
        let credentials = Credentials {
            username: "owner@example.com".to_string(),
            password: "pw".to_string(),
            serial_number: "122233344455".to_string(),
        };
        let session = SessionManager::new(
            Arc::clone(&backend),
            SessionConfig::new("https://envoy.local", credentials),
        )
        .with_session(Session::issued("s", TOKEN, Utc::now() + TimeDelta::hours(1)));
        (backend, EnvoyApi::new(Arc::new(session)))
    }

    #[test_case("production", Some(MeterRole::Production) ; "production")]
    #[test_case("PRODUCTION", Some(MeterRole::Production) ; "upper case")]
    #[test_case("net-consumption", Some(MeterRole::NetConsumption) ; "net consumption")]
    #[test_case("total-consumption", None ; "total consumption is not a meter role")]
    fn measurement_type_mapping(value: &str, expected: Option<MeterRole>) {
        assert_eq!(MeterRole::from_measurement_type(value), expected);
    }

    #[tokio::test]
    async fn meters_are_cached() {
        let (backend, api) = api(backend());

        let first = api.meters().await.unwrap();
        let second = api.meters().await.unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(first[&704_643_328], MeterRole::Production);
        assert_eq!(first[&704_643_584], MeterRole::NetConsumption);
        assert_eq!(first, second);
        assert_eq!(backend.count(METERS_PATH), 1);
    }

    #[tokio::test]
    async fn clear_cache_refetches_meters() {
        let (backend, api) = api(backend());

        api.meters().await.unwrap();
        api.clear_cache();
        api.meters().await.unwrap();

        assert_eq!(backend.count(METERS_PATH), 2);
    }

    #[tokio::test]
    async fn empty_meter_list_is_not_cached_and_yields_no_readings() {
        let (backend, api) = api(FakeBackend::new().with_response(METERS_PATH, HttpResponse::json(200, &json!([]))));

        let readings = api.meter_readings().await.unwrap();
        api.meters().await.unwrap();

        assert_eq!(readings, MeterReadings::default());
        assert_eq!(backend.count(METERS_PATH), 2);
        assert_eq!(backend.count(READINGS_PATH), 0);
    }

    #[tokio::test]
    async fn readings_are_keyed_by_role() {
        let (_, api) = api(backend());
        let readings = api.meter_readings().await.unwrap();

        assert_eq!(readings.production["instantaneousDemand"], 900.0);
        assert_eq!(readings.production["actEnergyDlvd"], 1_234_567.0);
        assert_eq!(readings.net_consumption["instantaneousDemand"], -150.0);
        assert_eq!(readings.net_consumption["actEnergyRcvd"], 400_000.0);
    }

    #[tokio::test]
    async fn reports_keep_total_and_net_cumulative() {
        let (_, api) = api(backend());
        let reports = api.consumption_reports().await.unwrap();

        assert_eq!(reports.total["currW"], 750.0);
        assert!(!reports.total.contains_key("flags"));
        assert_eq!(reports.net["whDlvdCum"], 765_433.0);
    }

    #[tokio::test]
    async fn production_summary_keeps_numeric_fields() {
        let (_, api) = api(backend());
        let summary = api.production_summary().await.unwrap();

        assert_eq!(summary.len(), 2);
        assert_eq!(summary["wattHoursToday"], 4100.0);
    }

    #[tokio::test]
    async fn non_array_payload_is_parse_error() {
        let (_, api) = api(FakeBackend::new().with_response(REPORTS_PATH, HttpResponse::json(200, &json!({"oops": 1}))));
        let err = api.consumption_reports().await.unwrap_err();
        assert!(matches!(err, ClientError::Parse { .. }));
    }

    #[tokio::test]
    async fn html_payload_is_parse_error() {
        let (_, api) = api(FakeBackend::new().with_response(PRODUCTION_PATH, HttpResponse::text(200, "<html></html>")));
        let err = api.production_summary().await.unwrap_err();
        assert!(matches!(err, ClientError::Parse { .. }));
    }

    #[tokio::test]
    async fn full_snapshot_combines_all_endpoints() {
        let (backend, api) = api(backend());
        let snapshot = api.fetch_full().await.unwrap();

        assert_eq!(snapshot.production_meter["instantaneousDemand"], 900.0);
        assert_eq!(snapshot.net_consumption_meter["instantaneousDemand"], -150.0);
        assert_eq!(snapshot.total_consumption["currW"], 750.0);
        assert_eq!(snapshot.net_consumption["whDlvdCum"], 765_433.0);
        assert_eq!(snapshot.production_summary["wattHoursToday"], 4100.0);
        assert_eq!(backend.count(PRODUCTION_PATH), 1);
    }

    #[tokio::test]
    async fn raw_snapshot_skips_production_summary() {
        let (backend, api) = api(backend());
        let snapshot = api.fetch_raw().await.unwrap();

        assert!(snapshot.production_summary.is_empty());
        assert_eq!(snapshot.total_consumption["currW"], 750.0);
        assert_eq!(backend.count(PRODUCTION_PATH), 0);
    }

    #[tokio::test]
    async fn failing_endpoint_fails_the_snapshot() {
        let backend = backend();
        backend.set_response(REPORTS_PATH, HttpResponse::text(500, "busy"));
        let (_, api) = api(backend);

        let err = api.fetch_full().await.unwrap_err();
        assert!(matches!(err, ClientError::HttpStatus { status: 500, .. }));
    }
}
