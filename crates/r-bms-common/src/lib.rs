//! ---
//! bms_section: "01-core-functionality"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Shared primitives and utilities for the core runtime."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
//! Core shared primitives for the R-BMS workspace.
//! This crate exposes configuration loading, logging setup, alarm severity
//! and virtual-clock helpers consumed across the workspace.

pub mod config;
pub mod logging;
pub mod severity;
pub mod time;

pub use config::{
    AlarmsConfig, AppConfig, BatteryProtectionConfig, ChargerOverheatConfig,
    DeviceProtectionConfig, FlowProtectionConfig, LoadedAppConfig, LoggingConfig,
    ProtectionConfig, SwitchConfig, TelemetryConfig,
};
pub use logging::{init_tracing, LogFormat, ALARM_TARGET};
pub use severity::AlarmLevel;
