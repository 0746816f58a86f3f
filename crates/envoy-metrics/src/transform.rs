//! Raw device payloads to canonical metrics.
//!
//! The transformer is a pure function over a [`DeviceSnapshot`]. Each payload
//! category has a static rename table; lifetime Wh counters additionally get a
//! kWh variant. Derived metrics are evaluated after the renames, in a fixed order:
//!
//! 1. `grid_eim_wNow` = `|net_demand|` when `net_demand < 0`, else `0`
//! 2. `eco_eim_wNow` = `production_demand + net_demand` when `net_demand < 0`,
//!    else `production_demand`
//! 3. `eco_eim_whLifetime` = `round(production_lifetime - grid_lifetime, 3)`
//!
//! A derived metric whose inputs are missing is omitted, never defaulted.

use tracing::trace;

use crate::types::{round_to, CanonicalMetricSet, DeviceSnapshot, RawMetricSet};

/// Canonical name of the production meter's instantaneous demand (W).
pub const PRODUCTION_DEMAND: &str = "prod_eim_wNow";
/// Canonical name of the net-consumption meter's instantaneous demand (W).
pub const NET_DEMAND: &str = "conso_net_eim_wNow";
/// Canonical name of the total consumption's instantaneous demand (W).
pub const TOTAL_CONSUMPTION_DEMAND: &str = "conso_all_eim_wNow";
/// Power currently exported to the grid (W).
pub const GRID_DEMAND: &str = "grid_eim_wNow";
/// Production consumed on site right now (W).
pub const SELF_CONSUMPTION_NOW: &str = "eco_eim_wNow";
/// Lifetime production counter (Wh).
pub const PRODUCTION_LIFETIME: &str = "prod_eim_whLifetime";
/// Lifetime energy exported to the grid (Wh).
pub const GRID_LIFETIME: &str = "grid_eim_whLifetime";
/// Lifetime production consumed on site (Wh).
pub const SELF_CONSUMPTION_LIFETIME: &str = "eco_eim_whLifetime";
/// Unix seconds at which the snapshot was captured.
pub const TIMESTAMP: &str = "timestamp";

/// Daily production delta.
pub const PRODUCTION_TODAY: &str = "prod_eim_today";
/// Daily grid-export delta.
pub const GRID_TODAY: &str = "grid_eim_today";
/// Daily self-consumption delta.
pub const SELF_CONSUMPTION_TODAY: &str = "eco_eim_today";

/// One entry of a rename table.
#[derive(Debug, Clone, Copy)]
struct FieldRule {
    source: &'static str,
    target: &'static str,
    /// Name of the kWh variant, for lifetime Wh counters.
    kwh: Option<&'static str>,
}

impl FieldRule {
    const fn plain(source: &'static str, target: &'static str) -> Self {
        Self {
            source,
            target,
            kwh: None,
        }
    }

    const fn lifetime(source: &'static str, target: &'static str, kwh: &'static str) -> Self {
        Self {
            source,
            target,
            kwh: Some(kwh),
        }
    }
}

const PRODUCTION_METER_RULES: &[FieldRule] = &[
    FieldRule::plain("instantaneousDemand", PRODUCTION_DEMAND),
    FieldRule::lifetime("actEnergyDlvd", PRODUCTION_LIFETIME, "prod_eim_kwhLifetime"),
    FieldRule::plain("today", "prod_eim_today"),
    FieldRule::plain("pwrFactor", "prod_eim_pwrFactor"),
    FieldRule::plain("voltage", "prod_eim_voltage"),
    FieldRule::plain("current", "prod_eim_current"),
];

const NET_CONSUMPTION_METER_RULES: &[FieldRule] = &[
    FieldRule::plain("instantaneousDemand", NET_DEMAND),
    FieldRule::lifetime("actEnergyRcvd", GRID_LIFETIME, "grid_eim_kwhLifetime"),
    FieldRule::lifetime("actEnergyDlvd", "import_eim_whLifetime", "import_eim_kwhLifetime"),
    FieldRule::plain("pwrFactor", "conso_net_eim_pwrFactor"),
    FieldRule::plain("voltage", "conso_net_eim_voltage"),
    FieldRule::plain("current", "conso_net_eim_current"),
];

const TOTAL_CONSUMPTION_RULES: &[FieldRule] = &[
    FieldRule::plain("currW", TOTAL_CONSUMPTION_DEMAND),
    FieldRule::plain("rmsCurrent", "conso_all_eim_rmsCurrent"),
    FieldRule::plain("rmsVoltage", "conso_all_eim_rmsVoltage"),
    FieldRule::lifetime("whDlvdCum", "conso_all_eim_whLifetime", "conso_all_eim_kwhLifetime"),
];

const NET_CONSUMPTION_RULES: &[FieldRule] = &[FieldRule::lifetime(
    "whDlvdCum",
    "conso_net_eim_whLifetime",
    "conso_net_eim_kwhLifetime",
)];

const PRODUCTION_SUMMARY_RULES: &[FieldRule] =
    &[FieldRule::plain("wattHoursToday", "prod_eim_wattHoursToday")];

/// Maps raw device payloads to canonical metric names.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricTransformer;

impl MetricTransformer {
    /// Builds the fast-cadence metric set.
    ///
    /// Only instantaneous demands and the capture timestamp are included.
    /// Missing demands are reported as `0` so the raw stream stays dense.
    #[must_use]
    pub fn transform_raw(snapshot: &DeviceSnapshot) -> CanonicalMetricSet {
        let field = |set: &RawMetricSet, name: &str| set.get(name).copied().unwrap_or(0.0);

        let mut out = CanonicalMetricSet::new();
        out.insert(
            TOTAL_CONSUMPTION_DEMAND.to_string(),
            field(&snapshot.total_consumption, "currW"),
        );
        out.insert(
            NET_DEMAND.to_string(),
            field(&snapshot.net_consumption_meter, "instantaneousDemand"),
        );
        out.insert(
            PRODUCTION_DEMAND.to_string(),
            field(&snapshot.production_meter, "instantaneousDemand"),
        );
        out.insert(TIMESTAMP.to_string(), unix_seconds(snapshot));
        out
    }

    /// Builds the full-cadence metric set: renamed fields plus derived metrics.
    #[must_use]
    pub fn transform_full(snapshot: &DeviceSnapshot) -> CanonicalMetricSet {
        let mut out = CanonicalMetricSet::new();

        apply_rules(&snapshot.production_meter, PRODUCTION_METER_RULES, &mut out);
        apply_rules(&snapshot.net_consumption_meter, NET_CONSUMPTION_METER_RULES, &mut out);

        let net_demand = snapshot.net_consumption_meter.get("instantaneousDemand").copied();
        let production_demand = snapshot.production_meter.get("instantaneousDemand").copied();

        if let Some(net) = net_demand {
            out.insert(GRID_DEMAND.to_string(), grid_demand(net));
            if let Some(production) = production_demand {
                out.insert(
                    SELF_CONSUMPTION_NOW.to_string(),
                    self_consumption_now(production, net),
                );
            }
        }

        if let (Some(production), Some(grid)) =
            (out.get(PRODUCTION_LIFETIME).copied(), out.get(GRID_LIFETIME).copied())
        {
            out.insert(
                SELF_CONSUMPTION_LIFETIME.to_string(),
                round_to(production - grid, 3),
            );
        }

        apply_rules(&snapshot.total_consumption, TOTAL_CONSUMPTION_RULES, &mut out);
        apply_rules(&snapshot.net_consumption, NET_CONSUMPTION_RULES, &mut out);
        apply_rules(&snapshot.production_summary, PRODUCTION_SUMMARY_RULES, &mut out);

        out.insert(TIMESTAMP.to_string(), unix_seconds(snapshot));

        trace!(fields = out.len(), "transformed full snapshot");
        out
    }

    /// Applies the instantaneous combination rules to daily deltas.
    ///
    /// Self-consumption today falls back to `production_today - grid_today`
    /// (clamped at zero) when it could not be tracked directly.
    pub fn combine_daily(daily: &mut CanonicalMetricSet) {
        if daily.contains_key(SELF_CONSUMPTION_TODAY) {
            return;
        }
        if let (Some(production), Some(grid)) = (
            daily.get(PRODUCTION_TODAY).copied(),
            daily.get(GRID_TODAY).copied(),
        ) {
            daily.insert(
                SELF_CONSUMPTION_TODAY.to_string(),
                (production - grid).max(0.0),
            );
        }
    }
}

fn unix_seconds(snapshot: &DeviceSnapshot) -> f64 {
    snapshot.captured_at.timestamp() as f64
}

fn apply_rules(raw: &RawMetricSet, rules: &[FieldRule], out: &mut CanonicalMetricSet) {
    for rule in rules {
        let Some(&value) = raw.get(rule.source) else {
            continue;
        };
        out.insert(rule.target.to_string(), value);
        if let Some(kwh) = rule.kwh {
            out.insert(kwh.to_string(), round_to(value / 1000.0, 3));
        }
    }
}

/// Power flowing to the grid: the magnitude of a negative net demand.
#[must_use]
pub fn grid_demand(net_demand: f64) -> f64 {
    if net_demand < 0.0 { net_demand.abs() } else { 0.0 }
}

/// Production consumed on site given the production and net demands.
#[must_use]
pub fn self_consumption_now(production_demand: f64, net_demand: f64) -> f64 {
    if net_demand < 0.0 {
        production_demand + net_demand
    } else {
        production_demand
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono::Utc;
    use test_case::test_case;

    fn raw(pairs: &[(&str, f64)]) -> RawMetricSet {
        pairs.iter().map(|(k, v)| ((*k).to_string(), *v)).collect()
    }

    fn full_snapshot() -> DeviceSnapshot {
        DeviceSnapshot {
            production_meter: raw(&[
                ("instantaneousDemand", 900.0),
                ("actEnergyDlvd", 1_234_567.0),
                ("today", 4200.0),
                ("voltage", 236.1),
                ("apparentPower", 910.0),
            ]),
            net_consumption_meter: raw(&[
                ("instantaneousDemand", -150.0),
                ("actEnergyRcvd", 400_000.0),
                ("actEnergyDlvd", 250_500.0),
            ]),
            total_consumption: raw(&[
                ("currW", 750.0),
                ("rmsCurrent", 3.2),
                ("rmsVoltage", 235.0),
                ("whDlvdCum", 2_000_000.0),
            ]),
            net_consumption: raw(&[("whDlvdCum", 765_433.0)]),
            production_summary: raw(&[("wattHoursToday", 4100.0), ("wattsNow", 880.0)]),
            captured_at: Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test_case(-150.0, 150.0 ; "exporting")]
    #[test_case(0.0, 0.0 ; "balanced")]
    #[test_case(320.0, 0.0 ; "importing")]
    fn grid_demand_cases(net: f64, expected: f64) {
        assert_eq!(grid_demand(net), expected);
    }

    #[test_case(900.0, -150.0, 750.0 ; "exporting subtracts export")]
    #[test_case(900.0, 0.0, 900.0 ; "balanced keeps production")]
    #[test_case(900.0, 200.0, 900.0 ; "importing keeps production")]
    fn self_consumption_cases(production: f64, net: f64, expected: f64) {
        assert_eq!(self_consumption_now(production, net), expected);
    }

    #[test]
    fn full_transform_renames_and_derives() {
        let out = MetricTransformer::transform_full(&full_snapshot());

        assert_eq!(out[PRODUCTION_DEMAND], 900.0);
        assert_eq!(out[PRODUCTION_LIFETIME], 1_234_567.0);
        assert_eq!(out["prod_eim_kwhLifetime"], 1234.567);
        assert_eq!(out["prod_eim_today"], 4200.0);
        assert_eq!(out["prod_eim_voltage"], 236.1);
        assert_eq!(out[NET_DEMAND], -150.0);
        assert_eq!(out[GRID_LIFETIME], 400_000.0);
        assert_eq!(out["grid_eim_kwhLifetime"], 400.0);
        assert_eq!(out["import_eim_whLifetime"], 250_500.0);
        assert_eq!(out["import_eim_kwhLifetime"], 250.5);
        assert_eq!(out[TOTAL_CONSUMPTION_DEMAND], 750.0);
        assert_eq!(out["conso_all_eim_rmsCurrent"], 3.2);
        assert_eq!(out["conso_all_eim_kwhLifetime"], 2000.0);
        assert_eq!(out["conso_net_eim_whLifetime"], 765_433.0);
        assert_eq!(out["conso_net_eim_kwhLifetime"], 765.433);
        assert_eq!(out["prod_eim_wattHoursToday"], 4100.0);
        assert_eq!(out[TIMESTAMP], 1_717_243_200.0);

        assert_eq!(out[GRID_DEMAND], 150.0);
        assert_eq!(out[SELF_CONSUMPTION_NOW], 750.0);
        assert_eq!(out[SELF_CONSUMPTION_LIFETIME], 834_567.0);
    }

    #[test]
    fn unmapped_fields_are_dropped() {
        let out = MetricTransformer::transform_full(&full_snapshot());
        assert!(!out.contains_key("voltage"));
        assert!(!out.contains_key("wattsNow"));
        assert!(!out.contains_key("apparentPower"));
        assert!(!out.contains_key("prod_eim_apparentPower"));
    }

    #[test]
    fn missing_inputs_omit_derived_fields() {
        let snapshot = DeviceSnapshot {
            production_meter: raw(&[("instantaneousDemand", 500.0)]),
            ..DeviceSnapshot::default()
        };
        let out = MetricTransformer::transform_full(&snapshot);

        assert_eq!(out[PRODUCTION_DEMAND], 500.0);
        assert!(!out.contains_key(GRID_DEMAND));
        assert!(!out.contains_key(SELF_CONSUMPTION_NOW));
        assert!(!out.contains_key(SELF_CONSUMPTION_LIFETIME));
    }

    #[test]
    fn net_demand_without_production_still_yields_grid_demand() {
        let snapshot = DeviceSnapshot {
            net_consumption_meter: raw(&[("instantaneousDemand", -80.0)]),
            ..DeviceSnapshot::default()
        };
        let out = MetricTransformer::transform_full(&snapshot);

        assert_eq!(out[GRID_DEMAND], 80.0);
        assert!(!out.contains_key(SELF_CONSUMPTION_NOW));
    }

    #[test]
    fn raw_transform_defaults_missing_demands_to_zero() {
        let snapshot = DeviceSnapshot {
            production_meter: raw(&[("instantaneousDemand", 640.0)]),
            ..DeviceSnapshot::default()
        };
        let out = MetricTransformer::transform_raw(&snapshot);

        assert_eq!(out.len(), 4);
        assert_eq!(out[PRODUCTION_DEMAND], 640.0);
        assert_eq!(out[NET_DEMAND], 0.0);
        assert_eq!(out[TOTAL_CONSUMPTION_DEMAND], 0.0);
        assert_eq!(out[TIMESTAMP], 0.0);
    }

    #[test]
    fn combine_daily_derives_self_consumption() {
        let mut daily = CanonicalMetricSet::new();
        daily.insert(PRODUCTION_TODAY.to_string(), 5000.0);
        daily.insert(GRID_TODAY.to_string(), 1200.0);

        MetricTransformer::combine_daily(&mut daily);

        assert_eq!(daily[SELF_CONSUMPTION_TODAY], 3800.0);
    }

    #[test]
    fn combine_daily_keeps_tracked_self_consumption() {
        let mut daily = CanonicalMetricSet::new();
        daily.insert(PRODUCTION_TODAY.to_string(), 5000.0);
        daily.insert(GRID_TODAY.to_string(), 1200.0);
        daily.insert(SELF_CONSUMPTION_TODAY.to_string(), 3700.0);

        MetricTransformer::combine_daily(&mut daily);

        assert_eq!(daily[SELF_CONSUMPTION_TODAY], 3700.0);
    }

    #[test]
    fn combine_daily_clamps_at_zero() {
        let mut daily = CanonicalMetricSet::new();
        daily.insert(PRODUCTION_TODAY.to_string(), 100.0);
        daily.insert(GRID_TODAY.to_string(), 300.0);

        MetricTransformer::combine_daily(&mut daily);

        assert_eq!(daily[SELF_CONSUMPTION_TODAY], 0.0);
    }
}
