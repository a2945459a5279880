//! ---
//! bms_section: "04-protection-control"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Protection policies, debounce monitors and load actuation."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use std::sync::Arc;

use chrono::{DateTime, Utc};
use r_bms_alarms::{AlarmLedger, AlarmLevel};
use thiserror::Error;

use crate::flow::Flow;
use crate::relay::{RelayError, RelayState};
use crate::switch::LoadSwitch;

pub const BOTTOM_BATTERY_LP: u32 = 0;
pub const BOTTOM_BATTERY_HP: u32 = 1;
pub const TOP_BATTERY_LP: u32 = 2;
pub const TOP_BATTERY_HP: u32 = 3;
pub const CHARGER_LP: u32 = 4;
pub const CHARGER_HP: u32 = 5;
pub const CHARGER_LOAD_LP: u32 = 6;
pub const CHARGER_LOAD_HP: u32 = 7;
pub const CHARGER_OVERHEAT: u32 = 8;
pub const BATTERY_BALANCE: u32 = 9;
pub const DEVICE: u32 = 10;
pub const ACTUATOR_POLICY_ID: u32 = 11;

#[derive(Debug, Error)]
pub enum ProtectionError {
    #[error("relay access failed: {0}")]
    Relay(#[from] RelayError),
    #[error("policy {policy} misconfigured: {reason}")]
    InvalidConfig { policy: String, reason: String },
}

/// Common capability of every protection policy.
pub trait ProtectionPolicy: Send {
    fn name(&self) -> &str;

    /// Alarm id base; conditions raise `policy_id * 100 + offset`.
    fn policy_id(&self) -> u32;

    /// Fire monitors whose debounce period elapsed.
    fn poll(&mut self, now: DateTime<Utc>) -> Result<(), ProtectionError>;
}

/// Policy consuming one [`Flow`] per telemetry tick.
pub trait FlowPolicy: ProtectionPolicy {
    fn set_flow(&mut self, flow: &Flow, now: DateTime<Utc>) -> Result<(), ProtectionError>;
}

/// Shared services handed to each policy at construction.
#[derive(Clone)]
pub struct PolicyContext {
    pub ledger: Arc<AlarmLedger>,
    pub switch: Arc<dyn LoadSwitch>,
}

impl PolicyContext {
    pub fn new(ledger: Arc<AlarmLedger>, switch: Arc<dyn LoadSwitch>) -> Self {
        Self { ledger, switch }
    }

    /// Whether an alarm at `level` may drive the relay automatically.
    pub fn authorizes(&self, level: AlarmLevel) -> bool {
        level >= self.ledger.settings().action_level
    }
}

impl std::fmt::Debug for PolicyContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyContext").finish_non_exhaustive()
    }
}

/// Relay action that resolves a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Corrective {
    RemoveLoad,
    SwitchLoad,
    /// Operator attention only.
    None,
}

impl Corrective {
    pub fn apply(self, switch: &dyn LoadSwitch, now: DateTime<Utc>, force: bool) {
        match self {
            Corrective::RemoveLoad => switch.remove_load(now, force),
            Corrective::SwitchLoad => switch.switch_load(now, force),
            Corrective::None => {}
        }
    }

    /// Whether the action would change a relay currently in `state`.
    pub fn is_possible(self, state: RelayState) -> bool {
        match self {
            Corrective::RemoveLoad => state == RelayState::On,
            Corrective::SwitchLoad => state == RelayState::Off,
            Corrective::None => false,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Corrective::RemoveLoad => "Removing load from battery",
            Corrective::SwitchLoad => "Switching load on battery",
            Corrective::None => "Check installation",
        }
    }

    /// Action text when the relay already sits where the action would put it.
    pub fn blocked(self) -> &'static str {
        match self {
            Corrective::RemoveLoad => "Load already removed; check charger and battery",
            Corrective::SwitchLoad => "Load already on; reduce charging manually",
            Corrective::None => "Check installation",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrective_feasibility_follows_relay() {
        assert!(Corrective::RemoveLoad.is_possible(RelayState::On));
        assert!(!Corrective::RemoveLoad.is_possible(RelayState::Off));
        assert!(Corrective::SwitchLoad.is_possible(RelayState::Off));
        assert!(!Corrective::None.is_possible(RelayState::On));
    }
}
