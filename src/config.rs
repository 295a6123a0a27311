//! Service configuration.
//!
//! Strongly-typed settings loaded with figment from a TOML file plus
//! `GRIDPULSE_`-prefixed environment overrides (nested keys split on `__`,
//! e.g. `GRIDPULSE_SERVICE__LOG_LEVEL=debug`). Parsing and semantics are
//! validated separately: figment errors mean the file is malformed,
//! `validate()` catches values that parse but cannot run — both are fatal at
//! startup, the service never starts serving with broken upstream
//! configuration.
//!
//! # Example
//!
//! ```toml
//! [service]
//! bind_addr = "0.0.0.0:5000"
//! api_key = "change-me"
//! default_device = "meter-1"
//!
//! [upstream]
//! mode = "mqtt"
//!
//! [upstream.mqtt]
//! broker_host = "broker.example.net"
//! username = "gridpulse"
//! password = "secret"
//!
//! [registry]
//! sweep_interval = "60s"
//! inactivity_timeout = "1h"
//!
//! [storage]
//! endpoint = "http://storage.internal:8000"
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::AppResult;

/// Top-level configuration tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub service: ServiceSettings,
    pub upstream: UpstreamSettings,
    #[serde(default)]
    pub registry: RegistrySettings,
    /// Absent means measurements are not persisted (sink disabled).
    #[serde(default)]
    pub storage: Option<StorageSettings>,
}

/// HTTP surface and service identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSettings {
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// When set, every API request must present this key; when unset,
    /// authentication is disabled entirely.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Device the dashboard selects when none is chosen yet. Registered at
    /// startup when set.
    #[serde(default)]
    pub default_device: Option<String>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            bind_addr: default_bind_addr(),
            api_key: None,
            default_device: None,
        }
    }
}

/// Which event-stream transport feeds the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamMode {
    Mqtt,
    Simulated,
}

/// Upstream event-source selection and per-transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSettings {
    pub mode: UpstreamMode,
    #[serde(default)]
    pub mqtt: Option<MqttSettings>,
    #[serde(default)]
    pub simulated: SimulatedSettings,
}

/// Broker connection settings for the MQTT transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttSettings {
    pub broker_host: String,
    #[serde(default = "default_broker_port")]
    pub broker_port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
    /// Per-device topic; `{device_id}` is replaced with the subscribed id.
    #[serde(default = "default_topic_template")]
    pub topic_template: String,
    #[serde(default = "default_keep_alive", with = "humantime_serde")]
    pub keep_alive: Duration,
}

impl MqttSettings {
    /// Resolve the telemetry topic for one device.
    pub fn topic_for(&self, device_id: &str) -> String {
        self.topic_template.replace("{device_id}", device_id)
    }
}

/// Settings for the broker-less simulated source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedSettings {
    #[serde(default = "default_sample_interval", with = "humantime_serde")]
    pub sample_interval: Duration,
    #[serde(default = "default_sim_phases")]
    pub phases: usize,
    #[serde(default = "default_nominal_voltage")]
    pub nominal_voltage: f64,
}

impl Default for SimulatedSettings {
    fn default() -> Self {
        Self {
            sample_interval: default_sample_interval(),
            phases: default_sim_phases(),
            nominal_voltage: default_nominal_voltage(),
        }
    }
}

/// Idle-eviction tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySettings {
    /// How often the reaper scans for idle entries.
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// How long an entry may go unqueried before eviction.
    #[serde(default = "default_inactivity_timeout", with = "humantime_serde")]
    pub inactivity_timeout: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            sweep_interval: default_sweep_interval(),
            inactivity_timeout: default_inactivity_timeout(),
        }
    }
}

/// External storage API used by the persistence sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_storage_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

fn default_service_name() -> String {
    "gridpulse".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:5000".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

fn default_client_id_prefix() -> String {
    "gridpulse".to_string()
}

fn default_topic_template() -> String {
    "devices/{device_id}/telemetry".to_string()
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(30)
}

fn default_sample_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_sim_phases() -> usize {
    3
}

fn default_nominal_voltage() -> f64 {
    230.0
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_inactivity_timeout() -> Duration {
    Duration::from_secs(3600)
}

fn default_storage_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Settings {
    /// Load configuration from the default path and environment variables.
    pub fn load() -> AppResult<Self> {
        Self::load_from("config/gridpulse.toml")
    }

    /// Load configuration from a specific file path, merged with
    /// `GRIDPULSE_` environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("GRIDPULSE_").split("__"))
            .extract()?;
        Ok(settings)
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.service.log_level.as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.service.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.service.bind_addr.parse::<SocketAddr>().is_err() {
            return Err(format!(
                "Invalid bind_addr '{}'. Expected host:port",
                self.service.bind_addr
            ));
        }

        if self.upstream.mode == UpstreamMode::Mqtt {
            let Some(mqtt) = &self.upstream.mqtt else {
                return Err(
                    "upstream.mode is 'mqtt' but no [upstream.mqtt] section is configured"
                        .to_string(),
                );
            };
            if mqtt.broker_host.trim().is_empty() {
                return Err("upstream.mqtt.broker_host must not be empty".to_string());
            }
            if mqtt.broker_port == 0 {
                return Err("upstream.mqtt.broker_port must not be 0".to_string());
            }
            if !mqtt.topic_template.contains("{device_id}") {
                return Err(format!(
                    "upstream.mqtt.topic_template '{}' has no {{device_id}} placeholder; \
                     every subscription must be filtered to one device",
                    mqtt.topic_template
                ));
            }
            if mqtt.username.is_some() != mqtt.password.is_some() {
                return Err(
                    "upstream.mqtt.username and password must be set together".to_string()
                );
            }
        }

        let sim = &self.upstream.simulated;
        if self.upstream.mode == UpstreamMode::Simulated
            && !(1..=crate::telemetry::MAX_PHASES).contains(&sim.phases)
        {
            return Err(format!(
                "upstream.simulated.phases must be 1..={}, got {}",
                crate::telemetry::MAX_PHASES,
                sim.phases
            ));
        }

        if self.registry.sweep_interval.is_zero() {
            return Err("registry.sweep_interval must be greater than zero".to_string());
        }
        if self.registry.inactivity_timeout.is_zero() {
            return Err("registry.inactivity_timeout must be greater than zero".to_string());
        }

        if let Some(storage) = &self.storage {
            if !storage.endpoint.starts_with("http://") && !storage.endpoint.starts_with("https://")
            {
                return Err(format!(
                    "storage.endpoint '{}' must be an http(s) URL",
                    storage.endpoint
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Settings {
        Figment::new()
            .merge(Toml::string(toml_str))
            .extract()
            .expect("config parses")
    }

    #[test]
    fn minimal_mqtt_config_parses_with_defaults() {
        let settings = parse(
            r#"
            [upstream]
            mode = "mqtt"

            [upstream.mqtt]
            broker_host = "broker.example.net"
            "#,
        );

        assert!(settings.validate().is_ok());
        assert_eq!(settings.service.log_level, "info");
        assert_eq!(settings.registry.sweep_interval, Duration::from_secs(60));
        assert_eq!(
            settings.registry.inactivity_timeout,
            Duration::from_secs(3600)
        );
        let mqtt = settings.upstream.mqtt.expect("mqtt section");
        assert_eq!(mqtt.broker_port, 1883);
        assert_eq!(mqtt.topic_for("meter-1"), "devices/meter-1/telemetry");
    }

    #[test]
    fn load_from_reads_a_config_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("gridpulse.toml");
        std::fs::write(
            &path,
            r#"
            [service]
            bind_addr = "127.0.0.1:5055"

            [upstream]
            mode = "simulated"
            "#,
        )
        .expect("write config");

        let settings = Settings::load_from(&path).expect("loads");
        assert_eq!(settings.service.bind_addr, "127.0.0.1:5055");
        assert_eq!(settings.upstream.mode, UpstreamMode::Simulated);
    }

    #[test]
    fn humantime_durations_parse() {
        let settings = parse(
            r#"
            [upstream]
            mode = "simulated"

            [registry]
            sweep_interval = "30s"
            inactivity_timeout = "2h"
            "#,
        );
        assert_eq!(settings.registry.sweep_interval, Duration::from_secs(30));
        assert_eq!(
            settings.registry.inactivity_timeout,
            Duration::from_secs(7200)
        );
    }

    #[test]
    fn mqtt_mode_requires_broker_section() {
        let settings = parse(
            r#"
            [upstream]
            mode = "mqtt"
            "#,
        );
        let err = settings.validate().expect_err("must fail");
        assert!(err.contains("upstream.mqtt"));
    }

    #[test]
    fn topic_template_must_carry_device_placeholder() {
        let settings = parse(
            r#"
            [upstream]
            mode = "mqtt"

            [upstream.mqtt]
            broker_host = "broker.example.net"
            topic_template = "telemetry/all"
            "#,
        );
        assert!(settings.validate().is_err());
    }

    #[test]
    fn invalid_log_level_is_rejected() {
        let settings = parse(
            r#"
            [service]
            log_level = "chatty"

            [upstream]
            mode = "simulated"
            "#,
        );
        assert!(settings.validate().is_err());
    }

    #[test]
    fn credentials_must_come_in_pairs() {
        let settings = parse(
            r#"
            [upstream]
            mode = "mqtt"

            [upstream.mqtt]
            broker_host = "broker.example.net"
            username = "gridpulse"
            "#,
        );
        let err = settings.validate().expect_err("must fail");
        assert!(err.contains("together"));
    }

    #[test]
    fn storage_endpoint_must_be_http() {
        let settings = parse(
            r#"
            [upstream]
            mode = "simulated"

            [storage]
            endpoint = "ftp://storage.internal"
            "#,
        );
        assert!(settings.validate().is_err());
    }
}
