//! Aggregated JSON summaries for dashboards that want one topic per device.

use envoy_metrics::CanonicalMetricSet;
use serde::{Deserialize, Serialize};

/// Optional summary topics. Each summary is published only when its topic is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SummaryConfig {
    /// Topic for the PV production summary.
    pub pv_production_topic: Option<String>,
    /// Topic for the net consumption summary.
    pub net_consumption_topic: Option<String>,
}

/// Direction of energy at the grid connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EnergyFlow {
    /// Drawing from the grid.
    Consuming,
    /// Feeding the grid (or balanced).
    Producing,
}

/// PV production summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PvProductionSummary {
    /// Lifetime production in kWh.
    pub energy: Option<f64>,
    /// Current production in W.
    pub power: Option<f64>,
    /// Power factor.
    pub power_factor: Option<f64>,
    /// Voltage in V.
    pub voltage: Option<f64>,
    /// Current in A.
    pub current: Option<f64>,
}

impl PvProductionSummary {
    /// Builds the summary from canonical metrics.
    #[must_use]
    pub fn from_metrics(metrics: &CanonicalMetricSet) -> Self {
        let get = |name: &str| metrics.get(name).copied();
        Self {
            energy: get("prod_eim_kwhLifetime"),
            power: get("prod_eim_wNow"),
            power_factor: get("prod_eim_pwrFactor"),
            voltage: get("prod_eim_voltage"),
            current: get("prod_eim_current"),
        }
    }
}

/// Net consumption summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetConsumptionSummary {
    /// Lifetime net consumption in kWh.
    pub energy: Option<f64>,
    /// Whether the site is drawing from or feeding the grid.
    pub energy_flow: EnergyFlow,
    /// Power drawn from the grid in W, never negative.
    pub power_cons: f64,
    /// Net power in W; negative when exporting.
    pub power: Option<f64>,
    /// Power factor.
    pub power_factor: Option<f64>,
    /// Voltage in V.
    pub voltage: Option<f64>,
    /// Current in A.
    pub current: Option<f64>,
}

impl NetConsumptionSummary {
    /// Builds the summary from canonical metrics.
    #[must_use]
    pub fn from_metrics(metrics: &CanonicalMetricSet) -> Self {
        let get = |name: &str| metrics.get(name).copied();
        let power = get("conso_net_eim_wNow");
        let net = power.unwrap_or(0.0);
        Self {
            energy: get("conso_net_eim_kwhLifetime"),
            energy_flow: if net > 0.0 {
                EnergyFlow::Consuming
            } else {
                EnergyFlow::Producing
            },
            power_cons: net.max(0.0),
            power,
            power_factor: get("conso_net_eim_pwrFactor"),
            voltage: get("conso_net_eim_voltage"),
            current: get("conso_net_eim_current"),
        }
    }
}
