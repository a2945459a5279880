//! ---
//! bms_section: "01-core-functionality"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Shared primitives and utilities for the core runtime."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;
use crate::severity::AlarmLevel;
use crate::time::minutes;

fn default_history() -> usize {
    20
}

fn default_silence_minutes() -> u64 {
    5
}

fn default_cooldown_minutes() -> u64 {
    5
}

fn default_action_level() -> AlarmLevel {
    AlarmLevel::Medium
}

fn default_alarm_file() -> PathBuf {
    PathBuf::from("alarms.json")
}

fn default_hysteresis() -> f64 {
    0.05
}

fn default_hysteresis_volts() -> f64 {
    0.1
}

fn default_blackout() -> Duration {
    Duration::from_secs(300)
}

fn default_temperature_hysteresis() -> f64 {
    2.0
}

fn default_monitor_time() -> Duration {
    Duration::from_secs(300)
}

fn default_min_duration_between_switches() -> u64 {
    1
}

fn default_min_on_time() -> u64 {
    15
}

fn default_telemetry_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(250)
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_alarm_trail() -> bool {
    true
}

/// Primary configuration object for the R-BMS runtime.
///
/// The `protection` section has no default: a supervisor without thresholds
/// must not start.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub alarms: AlarmsConfig,
    pub protection: ProtectionConfig,
    #[serde(default)]
    pub switch: SwitchConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "R_BMS_CONFIG";

    /// Load configuration from disk, respecting the `R_BMS_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    /// Parse a single file; the format follows the extension (`.json`, `.yaml`/`.yml`, TOML otherwise).
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config: AppConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)
                .with_context(|| format!("failed to parse config file {}", path.display()))?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&contents)
                .with_context(|| format!("failed to parse config file {}", path.display()))?,
            _ => toml::from_str(&contents)
                .with_context(|| format!("failed to parse config file {}", path.display()))?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.alarms.validate()?;
        self.protection.validate()?;
        self.switch.validate()?;
        self.telemetry.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmsConfig {
    /// Retention target for the alarm history.
    #[serde(default = "default_history")]
    pub history: usize,
    #[serde(default = "default_silence_minutes")]
    pub silence_in_min: u64,
    /// Window in which a re-raise of the same id is suppressed.
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_in_min: u64,
    /// Alarms below this level render without their action text.
    #[serde(default = "default_action_level")]
    pub action_level: AlarmLevel,
    #[serde(default = "default_alarm_file")]
    pub file: PathBuf,
    #[serde(default)]
    pub journal: Option<PathBuf>,
}

impl AlarmsConfig {
    pub fn silence_duration(&self) -> Duration {
        minutes(self.silence_in_min)
    }

    pub fn cooldown(&self) -> Duration {
        minutes(self.cooldown_in_min)
    }

    fn validate(&self) -> Result<()> {
        if self.history == 0 {
            return Err(anyhow!("alarms.history must retain at least one alarm"));
        }
        Ok(())
    }
}

impl Default for AlarmsConfig {
    fn default() -> Self {
        Self {
            history: default_history(),
            silence_in_min: default_silence_minutes(),
            cooldown_in_min: default_cooldown_minutes(),
            action_level: default_action_level(),
            file: default_alarm_file(),
            journal: None,
        }
    }
}

/// Thresholds of every protection policy. All sections are mandatory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtectionConfig {
    pub battery_protection: BatteryProtectionConfig,
    pub battery_protection_low_priority: FlowProtectionConfig,
    pub battery_protection_high_priority: FlowProtectionConfig,
    pub charger_protection_low_priority: FlowProtectionConfig,
    pub charger_protection_high_priority: FlowProtectionConfig,
    pub charger_load_protection_low_priority: FlowProtectionConfig,
    pub charger_load_protection_high_priority: FlowProtectionConfig,
    pub charger_overheat_protection_high_priority: ChargerOverheatConfig,
    pub device_protection: DeviceProtectionConfig,
}

impl ProtectionConfig {
    fn validate(&self) -> Result<()> {
        self.battery_protection.validate()?;
        for (section, flow) in [
            (
                "batteryProtectionLowPriority",
                &self.battery_protection_low_priority,
            ),
            (
                "batteryProtectionHighPriority",
                &self.battery_protection_high_priority,
            ),
            (
                "chargerProtectionLowPriority",
                &self.charger_protection_low_priority,
            ),
            (
                "chargerProtectionHighPriority",
                &self.charger_protection_high_priority,
            ),
            (
                "chargerLoadProtectionLowPriority",
                &self.charger_load_protection_low_priority,
            ),
            (
                "chargerLoadProtectionHighPriority",
                &self.charger_load_protection_high_priority,
            ),
        ] {
            flow.validate(section)?;
        }
        self.charger_overheat_protection_high_priority.validate()?;
        self.device_protection.validate()?;
        Ok(())
    }
}

/// Current/voltage limits evaluated against one flow.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowProtectionConfig {
    pub abs_min_current: f64,
    pub abs_max_current: f64,
    pub min_voltage: f64,
    pub max_voltage: f64,
    pub when_current_below: f64,
    pub when_current_above: f64,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub duration_active: Duration,
    pub alarm_level: AlarmLevel,
    /// Relative recovery margin before a violated band counts as cleared.
    #[serde(default = "default_hysteresis")]
    pub hysteresis: f64,
    #[serde(default = "default_blackout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub blackout: Duration,
}

impl FlowProtectionConfig {
    pub fn validate(&self, section: &str) -> Result<()> {
        let values = [
            self.abs_min_current,
            self.abs_max_current,
            self.min_voltage,
            self.max_voltage,
            self.when_current_below,
            self.when_current_above,
            self.hysteresis,
        ];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(anyhow!("protection.{section} contains a non-finite limit"));
        }
        if self.abs_min_current >= self.abs_max_current {
            return Err(anyhow!(
                "protection.{section}: absMinCurrent ({}) must be below absMaxCurrent ({})",
                self.abs_min_current,
                self.abs_max_current
            ));
        }
        if self.min_voltage >= self.max_voltage {
            return Err(anyhow!(
                "protection.{section}: minVoltage ({}) must be below maxVoltage ({})",
                self.min_voltage,
                self.max_voltage
            ));
        }
        if !(0.0..1.0).contains(&self.hysteresis) {
            return Err(anyhow!(
                "protection.{section}: hysteresis must be a fraction in [0, 1)"
            ));
        }
        Ok(())
    }
}

/// Top/bottom pack balance limits.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatteryProtectionConfig {
    /// PV voltage surplus over the pack voltage needed for charging.
    pub min_diff_for_charge: f64,
    pub min_accu_voltage: f64,
    pub max_accu_voltage: f64,
    pub max_volt_diff: f64,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub duration_active: Duration,
    pub alarm_level: AlarmLevel,
    #[serde(default)]
    pub allow_night_discharge: bool,
    #[serde(default = "default_hysteresis_volts")]
    pub hysteresis_volts: f64,
    #[serde(default = "default_blackout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub blackout: Duration,
}

impl BatteryProtectionConfig {
    fn validate(&self) -> Result<()> {
        let values = [
            self.min_diff_for_charge,
            self.min_accu_voltage,
            self.max_accu_voltage,
            self.max_volt_diff,
            self.hysteresis_volts,
        ];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(anyhow!(
                "protection.batteryProtection contains a non-finite limit"
            ));
        }
        if self.min_accu_voltage >= self.max_accu_voltage {
            return Err(anyhow!(
                "protection.batteryProtection: minAccuVoltage ({}) must be below maxAccuVoltage ({})",
                self.min_accu_voltage,
                self.max_accu_voltage
            ));
        }
        if self.max_volt_diff <= 0.0 || self.hysteresis_volts < 0.0 {
            return Err(anyhow!(
                "protection.batteryProtection: maxVoltDiff must be positive and hysteresisVolts non-negative"
            ));
        }
        Ok(())
    }
}

/// Limits for the stuck-charger fault on the PV flow.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargerOverheatConfig {
    pub max_voltage: f64,
    pub when_current_below: f64,
    /// PV current below this value counts as reverse flow into the panels.
    #[serde(default)]
    pub abs_min_current: f64,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub duration_active: Duration,
    #[serde(default = "default_blackout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub blackout: Duration,
}

impl ChargerOverheatConfig {
    fn validate(&self) -> Result<()> {
        if [self.max_voltage, self.when_current_below, self.abs_min_current]
            .iter()
            .any(|v| !v.is_finite())
        {
            return Err(anyhow!(
                "protection.chargerOverheatProtectionHighPriority contains a non-finite limit"
            ));
        }
        if self.max_voltage <= 0.0 {
            return Err(anyhow!(
                "protection.chargerOverheatProtectionHighPriority: maxVoltage must be positive"
            ));
        }
        Ok(())
    }
}

/// Device fault handling reported by the charger and battery monitor.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProtectionConfig {
    pub max_temp: f64,
    /// How long the full indicator must hold before load is switched on.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub time_is_full: Duration,
    pub alarm_level: AlarmLevel,
    #[serde(default = "default_temperature_hysteresis")]
    pub temperature_hysteresis: f64,
    #[serde(default = "default_blackout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub blackout: Duration,
}

impl DeviceProtectionConfig {
    fn validate(&self) -> Result<()> {
        if !self.max_temp.is_finite() || !self.temperature_hysteresis.is_finite() {
            return Err(anyhow!(
                "protection.deviceProtection contains a non-finite limit"
            ));
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchConfig {
    /// Delay before the relay read-back is compared with the command.
    #[serde(default = "default_monitor_time")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub monitor_time_in_s: Duration,
    #[serde(default = "default_min_duration_between_switches")]
    pub min_duration_between_switches_in_min: u64,
    /// Shortest ON period accepted before the sunset disconnect.
    #[serde(default = "default_min_on_time")]
    pub min_on_time_in_min: u64,
    /// Daily load disconnect as `HH:MM` UTC.
    #[serde(default)]
    pub remove_load_at_utc: Option<String>,
}

impl SwitchConfig {
    pub fn min_duration_between_switches(&self) -> Duration {
        minutes(self.min_duration_between_switches_in_min)
    }

    pub fn min_on_time(&self) -> Duration {
        minutes(self.min_on_time_in_min)
    }

    /// Parsed `removeLoadAtUtc`; `None` when unset or malformed.
    pub fn daily_disconnect(&self) -> Option<NaiveTime> {
        self.remove_load_at_utc
            .as_deref()
            .and_then(|text| NaiveTime::parse_from_str(text.trim(), "%H:%M").ok())
    }

    fn validate(&self) -> Result<()> {
        if let Some(text) = &self.remove_load_at_utc {
            NaiveTime::parse_from_str(text.trim(), "%H:%M").with_context(|| {
                format!("switch.removeLoadAtUtc must be HH:MM, got {text:?}")
            })?;
        }
        Ok(())
    }
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            monitor_time_in_s: default_monitor_time(),
            min_duration_between_switches_in_min: default_min_duration_between_switches(),
            min_on_time_in_min: default_min_on_time(),
            remove_load_at_utc: None,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryConfig {
    #[serde(default = "default_telemetry_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub interval_sec: Duration,
    /// Resolution at which timers are polled between telemetry ticks.
    #[serde(default = "default_poll_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub poll_interval_ms: Duration,
    #[serde(default)]
    pub replay: Option<PathBuf>,
}

impl TelemetryConfig {
    fn validate(&self) -> Result<()> {
        if self.interval_sec.is_zero() || self.poll_interval_ms.is_zero() {
            return Err(anyhow!(
                "telemetry intervals must be greater than zero"
            ));
        }
        Ok(())
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            interval_sec: default_telemetry_interval(),
            poll_interval_ms: default_poll_interval(),
            replay: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    /// Write alarm events to their own daily file regardless of the log filter.
    #[serde(default = "default_alarm_trail")]
    pub alarm_trail: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
            alarm_trail: default_alarm_trail(),
        }
    }
}
