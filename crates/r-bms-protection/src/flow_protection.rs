//! ---
//! bms_section: "04-protection-control"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Protection policies, debounce monitors and load actuation."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use r_bms_alarms::AlarmId;
use r_bms_common::config::FlowProtectionConfig;
use tracing::{debug, info};

use crate::flow::Flow;
use crate::monitor::{Monitor, MonitorState};
use crate::policy::{Corrective, FlowPolicy, PolicyContext, ProtectionError, ProtectionPolicy};

/// Hysteresis bands watched by a [`FlowProtection`], in alarm offset order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowCondition {
    /// Current at or below `absMinCurrent`: too much load.
    UnderCurrent = 0,
    /// Current at or above `absMaxCurrent`: excess charge current.
    OverCurrent = 1,
    /// Voltage at or below `minVoltage` while current is small.
    LowVoltage = 2,
    /// Voltage at or above `maxVoltage` while still charging.
    HighVoltage = 3,
}

impl FlowCondition {
    pub const ALL: [FlowCondition; 4] = [
        FlowCondition::UnderCurrent,
        FlowCondition::OverCurrent,
        FlowCondition::LowVoltage,
        FlowCondition::HighVoltage,
    ];

    pub fn offset(self) -> u32 {
        self as u32
    }

    pub fn corrective(self) -> Corrective {
        match self {
            FlowCondition::UnderCurrent | FlowCondition::LowVoltage => Corrective::RemoveLoad,
            FlowCondition::OverCurrent | FlowCondition::HighVoltage => Corrective::SwitchLoad,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Band {
    Violated,
    /// Between limit and recovery margin; nothing changes.
    Hold,
    /// Gate released without the measurement recovering: stop arming, keep the alarm.
    Disarm,
    Recovered,
}

#[derive(Debug, Clone)]
struct FlowViolation {
    condition: FlowCondition,
    failure: String,
}

/// Threshold checks with asymmetric raise and clear limits over one flow.
pub struct FlowProtection {
    policy_id: u32,
    name: String,
    config: FlowProtectionConfig,
    ctx: PolicyContext,
    monitors: [Monitor<FlowViolation>; 4],
}

impl std::fmt::Debug for FlowProtection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowProtection")
            .field("policy_id", &self.policy_id)
            .field("name", &self.name)
            .field("monitors", &self.monitors)
            .finish()
    }
}

impl FlowProtection {
    pub fn new(
        policy_id: u32,
        name: impl Into<String>,
        config: FlowProtectionConfig,
        ctx: PolicyContext,
    ) -> Result<Self, ProtectionError> {
        let name = name.into();
        config
            .validate(&name)
            .map_err(|err| ProtectionError::InvalidConfig {
                policy: name.clone(),
                reason: format!("{err:#}"),
            })?;
        let monitors = std::array::from_fn(|_| Monitor::new(config.duration_active, config.blackout));
        Ok(Self {
            policy_id,
            name,
            config,
            ctx,
            monitors,
        })
    }

    pub fn alarm_id(&self, condition: FlowCondition) -> AlarmId {
        AlarmId::compose(self.policy_id, condition.offset())
    }

    pub fn monitor_state(&self, condition: FlowCondition) -> MonitorState {
        self.monitors[condition.index()].state()
    }

    fn margin(limit: f64, fraction: f64) -> f64 {
        limit.abs() * fraction
    }

    fn assess(&self, condition: FlowCondition, current: f64, voltage: f64) -> Band {
        let c = &self.config;
        let h = c.hysteresis;
        match condition {
            FlowCondition::UnderCurrent => {
                if current <= c.abs_min_current {
                    Band::Violated
                } else if current >= c.abs_min_current + Self::margin(c.abs_min_current, h) {
                    Band::Recovered
                } else {
                    Band::Hold
                }
            }
            FlowCondition::OverCurrent => {
                if current >= c.abs_max_current {
                    Band::Violated
                } else if current <= c.abs_max_current - Self::margin(c.abs_max_current, h) {
                    Band::Recovered
                } else {
                    Band::Hold
                }
            }
            FlowCondition::LowVoltage => {
                if voltage >= c.min_voltage + Self::margin(c.min_voltage, h) {
                    Band::Recovered
                } else if voltage > c.min_voltage {
                    Band::Hold
                } else if current <= c.when_current_below {
                    Band::Violated
                } else {
                    Band::Disarm
                }
            }
            FlowCondition::HighVoltage => {
                if voltage <= c.max_voltage - Self::margin(c.max_voltage, h) {
                    Band::Recovered
                } else if voltage < c.max_voltage {
                    Band::Hold
                } else if current >= c.when_current_above {
                    Band::Violated
                } else {
                    Band::Disarm
                }
            }
        }
    }

    fn failure_text(&self, condition: FlowCondition, current: f64, voltage: f64) -> String {
        let name = &self.name;
        match condition {
            FlowCondition::UnderCurrent => format!("{name}: too much load {current}A"),
            FlowCondition::OverCurrent => format!("{name}: high charge current {current}A"),
            FlowCondition::LowVoltage => format!(
                "{name}: battery capacity too low; voltage drop to {voltage}V for small current {current}A"
            ),
            FlowCondition::HighVoltage => format!(
                "{name}: battery capacity too high; voltage {voltage}V and charging at {current}A"
            ),
        }
    }

    fn fire(&self, violation: FlowViolation, now: DateTime<Utc>) {
        let condition = violation.condition;
        let corrective = condition.corrective();
        let level = self.config.alarm_level;
        self.ctx.ledger.raise(
            self.alarm_id(condition),
            level,
            violation.failure,
            corrective.describe(),
            now,
        );
        if self.ctx.authorizes(level) {
            info!(policy = %self.name, ?condition, "flow protection actuating");
            corrective.apply(self.ctx.switch.as_ref(), now, false);
        }
    }
}

impl ProtectionPolicy for FlowProtection {
    fn name(&self) -> &str {
        &self.name
    }

    fn policy_id(&self) -> u32 {
        self.policy_id
    }

    fn poll(&mut self, now: DateTime<Utc>) -> Result<(), ProtectionError> {
        let fired: Vec<FlowViolation> = self
            .monitors
            .iter_mut()
            .filter_map(|monitor| monitor.poll(now))
            .collect();
        for violation in fired {
            self.fire(violation, now);
        }
        Ok(())
    }
}

impl FlowPolicy for FlowProtection {
    fn set_flow(&mut self, flow: &Flow, now: DateTime<Utc>) -> Result<(), ProtectionError> {
        let (current, voltage) = (flow.current(), flow.voltage());
        if !flow.has_voltage() || !current.is_finite() || !voltage.is_finite() {
            return Ok(());
        }

        for condition in FlowCondition::ALL {
            match self.assess(condition, current, voltage) {
                Band::Violated => {
                    let failure = self.failure_text(condition, current, voltage);
                    let monitor = &mut self.monitors[condition.index()];
                    if monitor.set_active(now, FlowViolation { condition, failure }) {
                        debug!(policy = %self.name, ?condition, current, voltage, "flow condition arming");
                    }
                }
                Band::Hold => {}
                Band::Disarm => self.monitors[condition.index()].clear_active(),
                Band::Recovered => {
                    self.monitors[condition.index()].clear_active();
                    self.ctx.ledger.clear(self.alarm_id(condition), true, now);
                }
            }
        }
        self.poll(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> FlowProtectionConfig {
        FlowProtectionConfig {
            abs_min_current: -50.0,
            abs_max_current: 45.0,
            min_voltage: 11.5,
            max_voltage: 14.6,
            when_current_below: 2.0,
            when_current_above: 5.0,
            duration_active: Duration::from_secs(10),
            alarm_level: r_bms_alarms::AlarmLevel::High,
            hysteresis: 0.05,
            blackout: Duration::from_secs(300),
        }
    }

    #[test]
    fn bands_are_asymmetric() {
        use crate::relay::SimulatedRelay;
        use crate::switch::MonitoredSwitch;
        use r_bms_alarms::{AlarmLedger, LedgerSettings};
        use std::sync::Arc;

        let ledger = Arc::new(AlarmLedger::new(LedgerSettings::default()));
        let switch = Arc::new(MonitoredSwitch::new(
            Arc::new(SimulatedRelay::default()),
            ledger.clone(),
            &Default::default(),
        ));
        let policy =
            FlowProtection::new(1, "Bottom battery", config(), PolicyContext::new(ledger, switch))
                .unwrap();

        let under = FlowCondition::UnderCurrent;
        assert_eq!(policy.assess(under, -50.0, 12.0), Band::Violated);
        assert_eq!(policy.assess(under, -48.0, 12.0), Band::Hold);
        assert_eq!(policy.assess(under, -46.55, 12.0), Band::Recovered);

        let low = FlowCondition::LowVoltage;
        assert_eq!(policy.assess(low, 1.0, 11.4), Band::Violated);
        assert_eq!(policy.assess(low, 8.0, 11.4), Band::Disarm);
        assert_eq!(policy.assess(low, 1.0, 11.8), Band::Hold);
        assert_eq!(policy.assess(low, 1.0, 12.1), Band::Recovered);

        assert_eq!(policy.alarm_id(FlowCondition::HighVoltage).get(), 103);
    }
}
