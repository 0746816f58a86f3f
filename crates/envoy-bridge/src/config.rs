//! Bridge configuration.
//!
//! Loaded once at startup from a TOML file:
//! - `[envoy]`: gateway address and Enlighten account
//! - `[mqtt]`: broker connection and topic namespace
//! - `[schedule]`: loop cadences, bootstrap grace and rollover window
//! - `[summaries]`: optional aggregated JSON topics
//!
//! Passwords may instead come from `ENVOY_PASSWORD` and `MQTT_PASSWORD`.

use std::path::Path;
use std::time::Duration;

use envoy_client::{Credentials, SessionConfig};
use serde::{Deserialize, Serialize};

use crate::error::BridgeError;
use crate::summary::SummaryConfig;

/// Environment variable overriding `envoy.password`.
pub const ENVOY_PASSWORD_ENV: &str = "ENVOY_PASSWORD";

/// Environment variable overriding `mqtt.password`.
pub const MQTT_PASSWORD_ENV: &str = "MQTT_PASSWORD";

/// Gateway connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EnvoyConfig {
    /// Base URL of the gateway, e.g. `https://192.168.1.100`.
    pub host: String,
    /// Serial number of the gateway.
    pub serial_number: String,
    /// Enlighten account e-mail.
    pub username: String,
    /// Enlighten account password.
    pub password: String,
    /// Timeout for telemetry requests in seconds.
    pub request_timeout_secs: u64,
    /// Timeout for each authentication step in seconds.
    pub auth_timeout_secs: u64,
}

impl Default for EnvoyConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            serial_number: String::new(),
            username: String::new(),
            password: String::new(),
            request_timeout_secs: 15,
            auth_timeout_secs: 30,
        }
    }
}

impl EnvoyConfig {
    /// Builds the session settings for the client.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        let credentials = Credentials {
            username: self.username.clone(),
            password: self.password.clone(),
            serial_number: self.serial_number.clone(),
        };
        SessionConfig::new(&self.host, credentials)
            .with_request_timeout(Duration::from_secs(self.request_timeout_secs))
            .with_auth_timeout(Duration::from_secs(self.auth_timeout_secs))
    }
}

/// Broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker host name.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Broker user name.
    pub username: Option<String>,
    /// Broker password.
    pub password: Option<String>,
    /// First topic level of every published topic.
    pub base_topic: String,
    /// Client identifier; derived from the serial number when absent.
    pub client_id: Option<String>,
    /// Keep-alive interval in seconds.
    pub keep_alive_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            base_topic: "envoy".to_string(),
            client_id: None,
            keep_alive_secs: 30,
        }
    }
}

/// Loop cadences and reference-tracking timing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Fast loop interval in seconds; zero or negative disables the loop.
    pub raw_interval_secs: f64,
    /// Slow loop interval in seconds.
    pub full_interval_secs: f64,
    /// How long to wait for retained references at startup, in seconds.
    pub bootstrap_grace_secs: f64,
    /// How long after local midnight the rollover may fire, in seconds.
    pub rollover_window_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            raw_interval_secs: 1.0,
            full_interval_secs: 60.0,
            bootstrap_grace_secs: 10.0,
            rollover_window_secs: 300,
        }
    }
}

impl ScheduleConfig {
    /// Fast loop interval, or `None` when the loop is disabled.
    #[must_use]
    pub fn raw_interval(&self) -> Option<Duration> {
        if self.raw_interval_secs > 0.0 {
            Duration::try_from_secs_f64(self.raw_interval_secs).ok()
        } else {
            None
        }
    }

    /// Slow loop interval.
    #[must_use]
    pub fn full_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.full_interval_secs).unwrap_or_default()
    }

    /// Bootstrap grace window.
    #[must_use]
    pub fn bootstrap_grace(&self) -> Duration {
        Duration::try_from_secs_f64(self.bootstrap_grace_secs).unwrap_or_default()
    }

    /// Rollover window.
    #[must_use]
    pub const fn rollover_window(&self) -> Duration {
        Duration::from_secs(self.rollover_window_secs)
    }
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BridgeConfig {
    /// Gateway settings.
    #[serde(default)]
    pub envoy: EnvoyConfig,
    /// Broker settings.
    #[serde(default)]
    pub mqtt: MqttConfig,
    /// Timing settings.
    #[serde(default)]
    pub schedule: ScheduleConfig,
    /// Aggregated summary topics.
    #[serde(default)]
    pub summaries: SummaryConfig,
}

impl BridgeConfig {
    /// Load configuration from a TOML file, applying environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BridgeError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            BridgeError::Config(format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        let mut config = Self::parse(&content)?;
        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, BridgeError> {
        let config = Self::parse(content)?;
        config.validate()?;
        Ok(config)
    }

    fn parse(content: &str) -> Result<Self, BridgeError> {
        toml::from_str(content).map_err(|e| BridgeError::Config(format!("invalid TOML: {e}")))
    }

    /// Apply password overrides from the environment.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(password) = lookup(ENVOY_PASSWORD_ENV).filter(|p| !p.is_empty()) {
            self.envoy.password = password;
        }
        if let Some(password) = lookup(MQTT_PASSWORD_ENV).filter(|p| !p.is_empty()) {
            self.mqtt.password = Some(password);
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<(), BridgeError> {
        let required = [
            ("envoy.host", &self.envoy.host),
            ("envoy.serial_number", &self.envoy.serial_number),
            ("envoy.username", &self.envoy.username),
            ("envoy.password", &self.envoy.password),
            ("mqtt.host", &self.mqtt.host),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(BridgeError::Config(format!("{name} cannot be empty")));
            }
        }

        if !self.envoy.host.starts_with("http://") && !self.envoy.host.starts_with("https://") {
            return Err(BridgeError::Config(
                "envoy.host must start with http:// or https://".to_string(),
            ));
        }

        if self.mqtt.port == 0 {
            return Err(BridgeError::Config(
                "mqtt.port must be greater than 0".to_string(),
            ));
        }

        if self.mqtt.base_topic.is_empty() {
            return Err(BridgeError::Config(
                "mqtt.base_topic cannot be empty".to_string(),
            ));
        }

        if self.mqtt.base_topic.contains(['+', '#']) {
            return Err(BridgeError::Config(
                "mqtt.base_topic cannot contain MQTT wildcards".to_string(),
            ));
        }

        let full = self.schedule.full_interval_secs;
        if !full.is_finite() || full <= 0.0 {
            return Err(BridgeError::Config(
                "schedule.full_interval_secs must be greater than 0".to_string(),
            ));
        }

        if !self.schedule.raw_interval_secs.is_finite() {
            return Err(BridgeError::Config(
                "schedule.raw_interval_secs must be a finite number".to_string(),
            ));
        }

        let grace = self.schedule.bootstrap_grace_secs;
        if !grace.is_finite() || grace < 0.0 {
            return Err(BridgeError::Config(
                "schedule.bootstrap_grace_secs cannot be negative".to_string(),
            ));
        }

        if self.schedule.rollover_window_secs == 0 {
            return Err(BridgeError::Config(
                "schedule.rollover_window_secs must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// MQTT client identifier.
    #[must_use]
    pub fn client_id(&self) -> String {
        self.mqtt
            .client_id
            .clone()
            .unwrap_or_else(|| format!("envoy-bridge-{}", self.envoy.serial_number))
    }

    /// A sample configuration with placeholder credentials.
    #[must_use]
    pub fn sample() -> Self {
        Self {
            envoy: EnvoyConfig {
                host: "https://192.168.1.100".to_string(),
                serial_number: "123456789012".to_string(),
                username: "you@example.com".to_string(),
                password: "change-me".to_string(),
                ..EnvoyConfig::default()
            },
            ..Self::default()
        }
    }

    /// Save configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), BridgeError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| BridgeError::Config(format!("failed to serialize config: {e}")))?;
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }
}
