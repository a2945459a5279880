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
use r_bms_alarms::{AlarmId, AlarmLevel};
use r_bms_common::config::ChargerOverheatConfig;
use tracing::{debug, error};

use crate::flow::Flow;
use crate::monitor::{Monitor, MonitorState};
use crate::policy::{
    Corrective, FlowPolicy, PolicyContext, ProtectionError, ProtectionPolicy, CHARGER_OVERHEAT,
};

const MANUAL_RESET: &str = "Disconnect and reconnect the charger manually";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverheatCondition {
    /// High PV voltage while the charger delivers no current.
    Stuck = 0,
    /// Current flowing back into the panels.
    ReverseFlow = 1,
}

impl OverheatCondition {
    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone)]
struct OverheatEvent {
    condition: OverheatCondition,
    failure: String,
}

/// Detects a charger stuck with high PV voltage but no charge current.
///
/// The PV energy is then dissipated in the charger while the battery keeps
/// discharging. There is no remote reset, so once raised the alarm stays
/// active until an operator acknowledges and clears it.
pub struct ChargerOverheatProtection {
    name: String,
    config: ChargerOverheatConfig,
    ctx: PolicyContext,
    monitors: [Monitor<OverheatEvent>; 2],
}

impl std::fmt::Debug for ChargerOverheatProtection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChargerOverheatProtection")
            .field("name", &self.name)
            .field("monitors", &self.monitors)
            .finish_non_exhaustive()
    }
}

impl ChargerOverheatProtection {
    pub fn new(name: impl Into<String>, config: ChargerOverheatConfig, ctx: PolicyContext) -> Self {
        let monitors =
            std::array::from_fn(|_| Monitor::new(config.duration_active, config.blackout));
        Self {
            name: name.into(),
            config,
            ctx,
            monitors,
        }
    }

    pub fn alarm_id(condition: OverheatCondition) -> AlarmId {
        AlarmId::compose(CHARGER_OVERHEAT, condition as u32)
    }

    pub fn monitor_state(&self, condition: OverheatCondition) -> MonitorState {
        self.monitors[condition.index()].state()
    }

    fn report(
        &mut self,
        condition: OverheatCondition,
        violated: bool,
        failure: impl FnOnce() -> String,
        now: DateTime<Utc>,
    ) {
        let monitor = &mut self.monitors[condition.index()];
        if violated {
            if monitor.set_active(
                now,
                OverheatEvent {
                    condition,
                    failure: failure(),
                },
            ) {
                debug!(policy = %self.name, ?condition, "charger fault arming");
            }
        } else {
            monitor.clear_active();
        }
    }
}

impl ProtectionPolicy for ChargerOverheatProtection {
    fn name(&self) -> &str {
        &self.name
    }

    fn policy_id(&self) -> u32 {
        CHARGER_OVERHEAT
    }

    fn poll(&mut self, now: DateTime<Utc>) -> Result<(), ProtectionError> {
        let fired: Vec<OverheatEvent> = self
            .monitors
            .iter_mut()
            .filter_map(|monitor| monitor.poll(now))
            .collect();
        for event in fired {
            error!(policy = %self.name, condition = ?event.condition, "charger fault sustained");
            self.ctx.ledger.raise(
                Self::alarm_id(event.condition),
                AlarmLevel::High,
                event.failure,
                MANUAL_RESET,
                now,
            );
            Corrective::RemoveLoad.apply(self.ctx.switch.as_ref(), now, true);
        }
        Ok(())
    }
}

impl FlowPolicy for ChargerOverheatProtection {
    fn set_flow(&mut self, flow: &Flow, now: DateTime<Utc>) -> Result<(), ProtectionError> {
        if !flow.has_voltage() {
            return Ok(());
        }
        let (current, voltage) = (flow.current(), flow.voltage());
        let name = self.name.clone();

        let stuck = voltage >= self.config.max_voltage && current <= self.config.when_current_below;
        self.report(
            OverheatCondition::Stuck,
            stuck,
            || format!("{name}: charger discharging; PV voltage {voltage}V and charging at {current}A"),
            now,
        );

        let reverse = current < self.config.abs_min_current;
        self.report(
            OverheatCondition::ReverseFlow,
            reverse,
            || format!("{name}: reverse current {current}A into the panels at {voltage}V"),
            now,
        );
        self.poll(now)
    }
}
