//! Shared configuration logic for host, simulator, and tests.

use crate::profile::Profile;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Unknown profile '{0}'")]
    UnknownProfile(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub print_loop: PrintLoopConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub pause: PauseConfig,
    #[serde(default)]
    pub cancel: CancelConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub profiles: HashMap<String, Profile>,
    #[serde(default)]
    pub machines: Vec<MachineConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutorConfig {
    /// Transient link errors tolerated for one command before the machine faults.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_overflow_backoff_ms")]
    pub overflow_backoff_ms: u64,
    /// Consecutive overflows between diagnostic status probes.
    #[serde(default = "default_overflow_probe_threshold")]
    pub overflow_probe_threshold: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            overflow_backoff_ms: default_overflow_backoff_ms(),
            overflow_probe_threshold: default_overflow_probe_threshold(),
        }
    }
}

impl ExecutorConfig {
    pub fn overflow_backoff(&self) -> Duration {
        Duration::from_millis(self.overflow_backoff_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PrintLoopConfig {
    #[serde(default = "default_telemetry_line_interval")]
    pub telemetry_line_interval: u64,
    #[serde(default = "default_telemetry_interval_ms")]
    pub telemetry_interval_ms: u64,
    #[serde(default = "default_idle_step_ms")]
    pub idle_step_ms: u64,
    #[serde(default = "default_pause_step_ms")]
    pub pause_step_ms: u64,
}

impl Default for PrintLoopConfig {
    fn default() -> Self {
        Self {
            telemetry_line_interval: default_telemetry_line_interval(),
            telemetry_interval_ms: default_telemetry_interval_ms(),
            idle_step_ms: default_idle_step_ms(),
            pause_step_ms: default_pause_step_ms(),
        }
    }
}

impl PrintLoopConfig {
    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_millis(self.telemetry_interval_ms)
    }
    pub fn idle_step(&self) -> Duration {
        Duration::from_millis(self.idle_step_ms)
    }
    pub fn pause_step(&self) -> Duration {
        Duration::from_millis(self.pause_step_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PollerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
        }
    }
}

impl PollerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PauseConfig {
    #[serde(default = "default_lift_height")]
    pub lift_height: f64,
    #[serde(default = "default_retract_length")]
    pub retract_length: f64,
    #[serde(default = "default_travel_feedrate")]
    pub travel_feedrate: f64,
    #[serde(default = "default_extrude_feedrate")]
    pub extrude_feedrate: f64,
}

impl Default for PauseConfig {
    fn default() -> Self {
        Self {
            lift_height: default_lift_height(),
            retract_length: default_retract_length(),
            travel_feedrate: default_travel_feedrate(),
            extrude_feedrate: default_extrude_feedrate(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CancelConfig {
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

impl Default for CancelConfig {
    fn default() -> Self {
        Self {
            settle_ms: default_settle_ms(),
        }
    }
}

impl CancelConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkConfig {
    /// Attempts for non-authorization failures; "not authorized" is never retried.
    #[serde(default = "default_network_retries")]
    pub auth_retries: u32,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            auth_retries: default_network_retries(),
            request_timeout_ms: default_request_timeout_ms(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl NetworkConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineKind {
    Serial,
    Network,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MachineConfig {
    pub name: String,
    pub kind: MachineKind,
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default)]
    pub serial_number: Option<String>,
    /// Credential presented by networked machines at authentication.
    #[serde(default)]
    pub token: Option<String>,
}

impl Config {
    /// Resolve a profile by name. `default` is always available.
    pub fn profile(&self, name: &str) -> Result<Profile, ConfigError> {
        match self.profiles.get(name) {
            Some(profile) => {
                let mut profile = profile.clone();
                profile.name = name.to_string();
                Ok(profile)
            }
            None if name == "default" => Ok(Profile::default()),
            None => Err(ConfigError::UnknownProfile(name.to_string())),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for machine in &self.machines {
            self.profile(&machine.profile)?;
            match machine.kind {
                MachineKind::Serial if machine.port.is_none() => {
                    return Err(ConfigError::Invalid(format!(
                        "serial machine '{}' has no port",
                        machine.name
                    )));
                }
                MachineKind::Network if machine.address.is_none() => {
                    return Err(ConfigError::Invalid(format!(
                        "network machine '{}' has no address",
                        machine.name
                    )));
                }
                _ => {}
            }
        }
        if self.executor.overflow_probe_threshold == 0 {
            return Err(ConfigError::Invalid(
                "executor.overflow_probe_threshold must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_log_level() -> String { "info".to_string() }
fn default_max_retries() -> u32 { 100 }
fn default_overflow_backoff_ms() -> u64 { 25 }
fn default_overflow_probe_threshold() -> u32 { 20 }
fn default_telemetry_line_interval() -> u64 { 100 }
fn default_telemetry_interval_ms() -> u64 { 5000 }
fn default_idle_step_ms() -> u64 { 50 }
fn default_pause_step_ms() -> u64 { 100 }
fn default_poll_interval_ms() -> u64 { 5000 }
fn default_lift_height() -> f64 { 5.0 }
fn default_retract_length() -> f64 { 1.0 }
fn default_travel_feedrate() -> f64 { 3000.0 }
fn default_extrude_feedrate() -> f64 { 1800.0 }
fn default_settle_ms() -> u64 { 100 }
fn default_network_retries() -> u32 { 3 }
fn default_request_timeout_ms() -> u64 { 10_000 }
fn default_retry_delay_ms() -> u64 { 250 }
fn default_baud() -> u32 { 115200 }
fn default_profile() -> String { "default".to_string() }

pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let config: Config = match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("Failed to parse config TOML: {}", e);
                return Err(ConfigError::Toml(e));
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path, e);
            return Err(ConfigError::Io(e));
        }
    };
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.executor.max_retries, 100);
        assert_eq!(config.print_loop.telemetry_line_interval, 100);
        assert_eq!(config.poller.interval(), Duration::from_secs(5));
        assert!(config.machines.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn machines_and_profiles_parse() {
        let toml_str = r#"
[executor]
max_retries = 7

[profiles.replicator]
tool_count = 2
axes = { x = 225.0, y = 145.0, z = 150.0 }

[[machines]]
name = "rep2x"
kind = "serial"
port = "/dev/ttyACM0"
profile = "replicator"

[[machines]]
name = "fifth-gen"
kind = "network"
address = "10.0.0.5:9999"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.executor.max_retries, 7);
        let profile = config.profile("replicator").unwrap();
        assert_eq!(profile.name, "replicator");
        assert_eq!(profile.tool_count, 2);
        assert_eq!(profile.axes.z, 150.0);
        assert_eq!(config.machines[1].kind, MachineKind::Network);
        assert_eq!(config.machines[1].profile, "default");
    }

    #[test]
    fn unknown_profile_is_rejected() {
        let toml_str = r#"
[[machines]]
name = "m"
kind = "serial"
port = "/dev/null"
profile = "nope"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::UnknownProfile(p)) if p == "nope"));
    }

    #[test]
    fn serial_machine_requires_port() {
        let toml_str = r#"
[[machines]]
name = "m"
kind = "serial"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
