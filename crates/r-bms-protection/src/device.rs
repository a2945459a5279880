//! ---
//! bms_section: "04-protection-control"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Protection policies, debounce monitors and load actuation."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use std::time::Duration;

use chrono::{DateTime, Utc};
use r_bms_alarms::{AlarmId, AlarmLevel};
use r_bms_common::config::DeviceProtectionConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::monitor::{Monitor, MonitorState};
use crate::policy::{Corrective, PolicyContext, ProtectionError, ProtectionPolicy, DEVICE};

/// Fault indicators reported by the charger and battery monitor, in alarm offset order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCondition {
    Overload = 0,
    ShortCircuit = 1,
    BatteryOverload = 2,
    OverDischarge = 3,
    BatteryFull = 4,
    MonitorAlarm = 5,
    OverTemperature = 6,
}

impl DeviceCondition {
    pub const ALL: [DeviceCondition; 7] = [
        DeviceCondition::Overload,
        DeviceCondition::ShortCircuit,
        DeviceCondition::BatteryOverload,
        DeviceCondition::OverDischarge,
        DeviceCondition::BatteryFull,
        DeviceCondition::MonitorAlarm,
        DeviceCondition::OverTemperature,
    ];

    fn index(self) -> usize {
        self as usize
    }

    fn corrective(self) -> Corrective {
        match self {
            DeviceCondition::Overload
            | DeviceCondition::ShortCircuit
            | DeviceCondition::OverDischarge => Corrective::RemoveLoad,
            DeviceCondition::BatteryFull => Corrective::SwitchLoad,
            DeviceCondition::BatteryOverload
            | DeviceCondition::MonitorAlarm
            | DeviceCondition::OverTemperature => Corrective::None,
        }
    }
}

/// Alarm reason bits of the battery monitor.
const ALARM_REASONS: [(u32, &str); 8] = [
    (1, "Low Voltage"),
    (2, "High Voltage"),
    (4, "Low SOC"),
    (8, "Low Starter Voltage"),
    (16, "High Starter Voltage"),
    (32, "Low Temperature"),
    (64, "High Temperature"),
    (128, "Mid Voltage"),
];

/// Render an alarm reason bit mask, e.g. `Low Voltage, Low SOC`.
pub fn describe_alarm_reason(mask: u32) -> String {
    let names: Vec<&str> = ALARM_REASONS
        .iter()
        .filter(|(bit, _)| mask & bit != 0)
        .map(|(_, name)| *name)
        .collect();
    if names.is_empty() {
        format!("unknown reason {mask}")
    } else {
        names.join(", ")
    }
}

/// Changed device readings of one telemetry tick; `None` leaves a condition untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub is_overload: Option<bool>,
    pub is_short_circuit: Option<bool>,
    pub is_battery_overload: Option<bool>,
    pub is_over_discharge: Option<bool>,
    pub is_full: Option<bool>,
    pub alarm_state: Option<bool>,
    pub alarm_reason: Option<u32>,
    pub battery_temperature: Option<f64>,
}

#[derive(Debug, Clone)]
struct DeviceEvent {
    condition: DeviceCondition,
    level: AlarmLevel,
    failure: String,
}

/// Maps device fault indicators onto alarms and relay actions.
pub struct DeviceProtection {
    config: DeviceProtectionConfig,
    ctx: PolicyContext,
    monitors: [Monitor<DeviceEvent>; 7],
    alarm_reason: u32,
}

impl std::fmt::Debug for DeviceProtection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceProtection")
            .field("monitors", &self.monitors)
            .field("alarm_reason", &self.alarm_reason)
            .finish_non_exhaustive()
    }
}

impl DeviceProtection {
    pub fn new(config: DeviceProtectionConfig, ctx: PolicyContext) -> Self {
        let blackout = config.blackout;
        let time_is_full = config.time_is_full;
        let monitors = std::array::from_fn(|index| {
            let required = if index == DeviceCondition::BatteryFull.index() {
                time_is_full
            } else {
                Duration::ZERO
            };
            Monitor::new(required, blackout)
        });
        Self {
            config,
            ctx,
            monitors,
            alarm_reason: 0,
        }
    }

    pub fn alarm_id(condition: DeviceCondition) -> AlarmId {
        AlarmId::compose(DEVICE, condition as u32)
    }

    pub fn monitor_state(&self, condition: DeviceCondition) -> MonitorState {
        self.monitors[condition.index()].state()
    }

    /// Apply every reading present in `status`, then fire due monitors.
    pub fn apply(&mut self, status: &DeviceStatus, now: DateTime<Utc>) -> Result<(), ProtectionError> {
        if let Some(on) = status.is_overload {
            self.set_overload(on, now);
        }
        if let Some(on) = status.is_short_circuit {
            self.set_short_circuit(on, now);
        }
        if let Some(on) = status.is_battery_overload {
            self.set_battery_overload(on, now);
        }
        if let Some(on) = status.is_over_discharge {
            self.set_over_discharge(on, now);
        }
        if let Some(on) = status.is_full {
            self.set_battery_full(on, now);
        }
        if let Some(mask) = status.alarm_reason {
            self.set_alarm_reason(mask);
        }
        if let Some(on) = status.alarm_state {
            self.set_monitor_alarm(on, now);
        }
        if let Some(temp) = status.battery_temperature {
            self.set_battery_temperature(temp, now);
        }
        self.poll(now)
    }

    pub fn set_overload(&mut self, on: bool, now: DateTime<Utc>) {
        self.update(
            DeviceCondition::Overload,
            on,
            AlarmLevel::High,
            "Charger: load output overloaded".into(),
            now,
        );
    }

    pub fn set_short_circuit(&mut self, on: bool, now: DateTime<Utc>) {
        self.update(
            DeviceCondition::ShortCircuit,
            on,
            AlarmLevel::High,
            "Charger: short circuit on load output".into(),
            now,
        );
    }

    pub fn set_battery_overload(&mut self, on: bool, now: DateTime<Utc>) {
        let level = self.config.alarm_level;
        self.update(
            DeviceCondition::BatteryOverload,
            on,
            level,
            "Charger: battery overloaded".into(),
            now,
        );
    }

    pub fn set_over_discharge(&mut self, on: bool, now: DateTime<Utc>) {
        self.update(
            DeviceCondition::OverDischarge,
            on,
            AlarmLevel::High,
            "Charger: battery over-discharged".into(),
            now,
        );
    }

    /// Debounced by `timeIsFull` before the load is switched on.
    pub fn set_battery_full(&mut self, on: bool, now: DateTime<Utc>) {
        self.update(
            DeviceCondition::BatteryFull,
            on,
            AlarmLevel::Low,
            "Charger: battery full".into(),
            now,
        );
    }

    pub fn set_alarm_reason(&mut self, mask: u32) {
        self.alarm_reason = mask;
    }

    pub fn set_monitor_alarm(&mut self, on: bool, now: DateTime<Utc>) {
        let level = self.config.alarm_level;
        let failure = format!(
            "Battery monitor alarm: {}",
            describe_alarm_reason(self.alarm_reason)
        );
        self.update(DeviceCondition::MonitorAlarm, on, level, failure, now);
    }

    pub fn set_battery_temperature(&mut self, celsius: f64, now: DateTime<Utc>) {
        if !celsius.is_finite() {
            return;
        }
        let max = self.config.max_temp;
        let condition = DeviceCondition::OverTemperature;
        if celsius >= max {
            let level = self.config.alarm_level;
            self.update(
                condition,
                true,
                level,
                format!("Battery: temperature {celsius}°C above {max}°C"),
                now,
            );
        } else if celsius <= max - self.config.temperature_hysteresis {
            self.update(condition, false, AlarmLevel::Low, String::new(), now);
        }
    }

    fn update(
        &mut self,
        condition: DeviceCondition,
        on: bool,
        level: AlarmLevel,
        failure: String,
        now: DateTime<Utc>,
    ) {
        let monitor = &mut self.monitors[condition.index()];
        if on {
            if monitor.set_active(
                now,
                DeviceEvent {
                    condition,
                    level,
                    failure,
                },
            ) {
                debug!(?condition, "device condition reported");
            }
        } else {
            monitor.clear_active();
            self.ctx.ledger.clear(Self::alarm_id(condition), true, now);
        }
    }

    fn fire(&self, event: DeviceEvent, now: DateTime<Utc>) {
        let condition = event.condition;
        let corrective = condition.corrective();
        self.ctx.ledger.raise(
            Self::alarm_id(condition),
            event.level,
            event.failure,
            if corrective == Corrective::None {
                ""
            } else {
                corrective.describe()
            },
            now,
        );
        match condition {
            DeviceCondition::BatteryFull => {
                corrective.apply(self.ctx.switch.as_ref(), now, false);
            }
            _ if corrective != Corrective::None && self.ctx.authorizes(event.level) => {
                warn!(?condition, "device fault; removing load immediately");
                corrective.apply(self.ctx.switch.as_ref(), now, true);
            }
            _ => {}
        }
    }
}

impl ProtectionPolicy for DeviceProtection {
    fn name(&self) -> &str {
        "Device"
    }

    fn policy_id(&self) -> u32 {
        DEVICE
    }

    fn poll(&mut self, now: DateTime<Utc>) -> Result<(), ProtectionError> {
        let fired: Vec<DeviceEvent> = self
            .monitors
            .iter_mut()
            .filter_map(|monitor| monitor.poll(now))
            .collect();
        for event in fired {
            self.fire(event, now);
        }
        Ok(())
    }
}
