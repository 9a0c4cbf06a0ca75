use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use validator::{Validate, ValidationError};

use crate::controller::{DispatchSettings, LoopTimings};

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";
pub const CONFIG_PATH_ENV: &str = "ZFC_CONFIG";
pub const ENV_PREFIX: &str = "ZFC__";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("invalid configuration: {0}")]
    Invalid(#[from] validator::ValidationErrors),
    #[error("invalid listen address: {0}")]
    Address(#[from] std::net::AddrParseError),
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct Config {
    #[validate(nested)]
    pub server: ServerConfig,
    #[validate(nested)]
    pub meter: MeterConfig,
    #[validate(nested)]
    pub battery: BatteryConfig,
    #[validate(nested)]
    pub control: ControlConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[validate(nested)]
    pub simulation: Option<SimulationConfig>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ServerConfig {
    pub host: String,
    #[validate(range(min = 1))]
    pub port: u16,
    #[validate(range(min = 1, max = 300))]
    pub request_timeout_secs: u64,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeterKind {
    Shelly,
    Ecotracker,
    Simulated,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[validate(schema(function = "validate_meter"))]
pub struct MeterConfig {
    pub kind: MeterKind,
    /// Base URL of the meter, e.g. `http://192.168.1.50`
    pub url: Option<String>,
    #[validate(range(min = 100, max = 30_000))]
    pub timeout_ms: u64,
    #[validate(range(min = 1, max = 100))]
    pub max_failures_before_stop: u32,
}

impl MeterConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareMode {
    Modbus,
    Simulated,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[validate(schema(function = "validate_battery"))]
pub struct BatteryConfig {
    pub hardware: HardwareMode,
    /// Modbus TCP gateway all units share
    pub host: Option<String>,
    #[validate(range(min = 1))]
    pub port: u16,
    #[validate(length(min = 1))]
    pub unit_ids: Vec<u8>,
    #[validate(range(min = 100, max = 30_000))]
    pub timeout_ms: u64,
    /// Pause after a mode register write before the power write
    #[serde(default = "default_mode_settle_ms")]
    #[validate(range(max = 10_000))]
    pub mode_settle_ms: u64,
    #[validate(range(min = 0.0))]
    pub min_unit_power_w: f64,
    #[validate(range(min = 1.0, max = 100_000.0))]
    pub max_unit_power_w: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub min_soc_discharge: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub max_soc_charge: f64,
}

fn default_mode_settle_ms() -> u64 {
    500
}

impl BatteryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn mode_settle(&self) -> Duration {
        Duration::from_millis(self.mode_settle_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[validate(schema(function = "validate_control"))]
pub struct ControlConfig {
    pub target_charge_w: f64,
    pub target_discharge_w: f64,
    #[validate(range(min = 1.0))]
    pub max_slew_per_cycle_w: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub low_soc_threshold: f64,
    #[validate(range(max = 0.0))]
    pub low_soc_min_surplus_w: f64,
    #[validate(range(min = 0.0))]
    pub start_threshold_w: f64,
    #[validate(range(min = 100))]
    pub meter_poll_interval_ms: u64,
    #[validate(range(min = 100))]
    pub control_interval_ms: u64,
    #[validate(range(min = 1))]
    pub soc_refresh_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub json: bool,
    /// Daily rolling log files are written here when set
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

fn default_log_filter() -> String {
    "info,zero_feed_controller=debug,tower_http=info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
            directory: None,
        }
    }
}

/// Parameters of the in-process site model.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SimulationConfig {
    #[validate(range(min = 0.0))]
    pub base_load_w: f64,
    #[validate(range(min = 0.0))]
    pub pv_peak_w: f64,
    #[validate(range(min = 100.0))]
    pub capacity_wh: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub initial_soc_percent: f64,
    #[validate(range(min = 0.5, max = 1.0))]
    pub efficiency: f64,
    #[validate(range(min = 0.0))]
    pub noise_w: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            base_load_w: 350.0,
            pv_peak_w: 3000.0,
            capacity_wh: 5120.0,
            initial_soc_percent: 50.0,
            efficiency: 0.92,
            noise_w: 40.0,
        }
    }
}

fn invalid(code: &'static str, message: &'static str) -> ValidationError {
    let mut error = ValidationError::new(code);
    error.message = Some(Cow::Borrowed(message));
    error
}

fn validate_meter(meter: &MeterConfig) -> Result<(), ValidationError> {
    let has_url = meter.url.as_deref().is_some_and(|u| !u.trim().is_empty());
    if meter.kind != MeterKind::Simulated && !has_url {
        return Err(invalid("meter_url", "meter.url is required for HTTP meters"));
    }
    Ok(())
}

fn validate_battery(battery: &BatteryConfig) -> Result<(), ValidationError> {
    if battery.min_unit_power_w > battery.max_unit_power_w {
        return Err(invalid(
            "unit_power_range",
            "min_unit_power_w must not exceed max_unit_power_w",
        ));
    }
    if battery.min_soc_discharge >= battery.max_soc_charge {
        return Err(invalid(
            "soc_window",
            "min_soc_discharge must be below max_soc_charge",
        ));
    }
    if battery.unit_ids.iter().any(|id| !(1..=247).contains(id)) {
        return Err(invalid("unit_id_range", "unit ids must be within 1..=247"));
    }
    let unique: BTreeSet<_> = battery.unit_ids.iter().collect();
    if unique.len() != battery.unit_ids.len() {
        return Err(invalid("unit_id_duplicate", "unit ids must be unique"));
    }
    let has_host = battery.host.as_deref().is_some_and(|h| !h.trim().is_empty());
    if battery.hardware == HardwareMode::Modbus && !has_host {
        return Err(invalid("battery_host", "battery.host is required for modbus"));
    }
    Ok(())
}

fn validate_control(control: &ControlConfig) -> Result<(), ValidationError> {
    if !(control.target_charge_w < 0.0 && control.target_discharge_w > 0.0) {
        return Err(invalid(
            "target_band",
            "target_charge_w must be negative and target_discharge_w positive",
        ));
    }
    Ok(())
}

impl Config {
    /// TOML file (or `$ZFC_CONFIG`) overlaid with `ZFC__*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::from_figment(figment)
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Config = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            target_charge_w: self.control.target_charge_w,
            target_discharge_w: self.control.target_discharge_w,
            min_unit_power_w: self.battery.min_unit_power_w,
            max_unit_power_w: self.battery.max_unit_power_w,
            min_soc_discharge: self.battery.min_soc_discharge,
            max_soc_charge: self.battery.max_soc_charge,
            max_slew_per_cycle_w: self.control.max_slew_per_cycle_w,
            low_soc_threshold: self.control.low_soc_threshold,
            low_soc_min_surplus_w: self.control.low_soc_min_surplus_w,
            start_threshold_w: self.control.start_threshold_w,
        }
    }

    pub fn loop_timings(&self) -> LoopTimings {
        LoopTimings {
            meter_poll: Duration::from_millis(self.control.meter_poll_interval_ms),
            control: Duration::from_millis(self.control.control_interval_ms),
            soc_refresh: Duration::from_secs(self.control.soc_refresh_interval_secs),
        }
    }
}
