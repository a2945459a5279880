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
use r_bms_common::config::BatteryProtectionConfig;
use tracing::{debug, info, warn};

use crate::monitor::{Monitor, MonitorState};
use crate::policy::{
    Corrective, PolicyContext, ProtectionError, ProtectionPolicy, BATTERY_BALANCE,
};

/// Conditions of the two series packs, in alarm offset order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryCondition {
    /// Load draws from the packs while PV cannot charge them.
    NightDischarge = 0,
    TopLow = 1,
    BottomLow = 2,
    TopHigh = 3,
    BottomHigh = 4,
    /// Pack voltages differ by more than `maxVoltDiff`.
    Unbalanced = 5,
}

impl BatteryCondition {
    pub const ALL: [BatteryCondition; 6] = [
        BatteryCondition::NightDischarge,
        BatteryCondition::TopLow,
        BatteryCondition::BottomLow,
        BatteryCondition::TopHigh,
        BatteryCondition::BottomHigh,
        BatteryCondition::Unbalanced,
    ];

    pub fn corrective(self) -> Corrective {
        match self {
            BatteryCondition::NightDischarge
            | BatteryCondition::TopLow
            | BatteryCondition::BottomLow => Corrective::RemoveLoad,
            BatteryCondition::TopHigh | BatteryCondition::BottomHigh => Corrective::SwitchLoad,
            BatteryCondition::Unbalanced => Corrective::None,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Violated,
    Hold,
    Recovered,
}

#[derive(Debug, Clone)]
struct BatteryViolation {
    condition: BatteryCondition,
    failure: String,
}

/// Balance and limit checks across the top and bottom packs.
pub struct BatteryProtection {
    config: BatteryProtectionConfig,
    ctx: PolicyContext,
    monitors: [Monitor<BatteryViolation>; 6],
}

impl std::fmt::Debug for BatteryProtection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatteryProtection")
            .field("monitors", &self.monitors)
            .finish_non_exhaustive()
    }
}

impl BatteryProtection {
    pub fn new(config: BatteryProtectionConfig, ctx: PolicyContext) -> Self {
        let monitors =
            std::array::from_fn(|_| Monitor::new(config.duration_active, config.blackout));
        Self {
            config,
            ctx,
            monitors,
        }
    }

    pub fn alarm_id(condition: BatteryCondition) -> AlarmId {
        AlarmId::compose(BATTERY_BALANCE, condition as u32)
    }

    pub fn monitor_state(&self, condition: BatteryCondition) -> MonitorState {
        self.monitors[condition.index()].state()
    }

    /// Evaluate one sample of pack voltages and PV voltage.
    ///
    /// A missing (zero) pack voltage drops the whole sample; a zero PV
    /// voltage only skips the night discharge check.
    pub fn set_voltages(
        &mut self,
        top: f64,
        bottom: f64,
        pv: f64,
        now: DateTime<Utc>,
    ) -> Result<(), ProtectionError> {
        if top == 0.0 || bottom == 0.0 || !top.is_finite() || !bottom.is_finite() {
            return Ok(());
        }
        let c = &self.config;
        let hyst = c.hysteresis_volts;

        let low = |u: f64| {
            if u < c.min_accu_voltage {
                Verdict::Violated
            } else if u >= c.min_accu_voltage + hyst {
                Verdict::Recovered
            } else {
                Verdict::Hold
            }
        };
        let high = |u: f64| {
            if u > c.max_accu_voltage {
                Verdict::Violated
            } else if u <= c.max_accu_voltage - hyst {
                Verdict::Recovered
            } else {
                Verdict::Hold
            }
        };

        let mut verdicts = [Verdict::Hold; 6];
        verdicts[BatteryCondition::TopLow.index()] = low(top);
        verdicts[BatteryCondition::BottomLow.index()] = low(bottom);
        verdicts[BatteryCondition::TopHigh.index()] = high(top);
        verdicts[BatteryCondition::BottomHigh.index()] = high(bottom);

        // a pack outside its limits explains the imbalance already
        let out_of_range = verdicts[1..5].contains(&Verdict::Violated);
        let diff = (top - bottom).abs();
        verdicts[BatteryCondition::Unbalanced.index()] = if diff > c.max_volt_diff {
            if out_of_range {
                Verdict::Hold
            } else {
                Verdict::Violated
            }
        } else if diff <= c.max_volt_diff - hyst {
            Verdict::Recovered
        } else {
            Verdict::Hold
        };

        verdicts[BatteryCondition::NightDischarge.index()] = self.night_discharge(top + bottom, pv);

        for condition in BatteryCondition::ALL {
            match verdicts[condition.index()] {
                Verdict::Violated => {
                    let failure = self.failure_text(condition, top, bottom, pv);
                    let monitor = &mut self.monitors[condition.index()];
                    if monitor.set_active(now, BatteryViolation { condition, failure }) {
                        debug!(?condition, top, bottom, pv, "battery condition arming");
                    }
                }
                Verdict::Hold => {}
                Verdict::Recovered => {
                    self.monitors[condition.index()].clear_active();
                    self.ctx.ledger.clear(Self::alarm_id(condition), true, now);
                }
            }
        }
        self.poll(now)
    }

    fn night_discharge(&self, chain: f64, pv: f64) -> Verdict {
        if self.config.allow_night_discharge || pv == 0.0 || !pv.is_finite() {
            return Verdict::Hold;
        }
        let threshold = chain + self.config.min_diff_for_charge;
        let load_on = match self.ctx.switch.is_load_on() {
            Ok(on) => on,
            Err(err) => {
                debug!(error = %err, "load state unknown; night discharge check skipped");
                return Verdict::Hold;
            }
        };
        if !load_on {
            Verdict::Recovered
        } else if pv < threshold {
            Verdict::Violated
        } else if pv >= threshold + self.config.hysteresis_volts {
            Verdict::Recovered
        } else {
            Verdict::Hold
        }
    }

    fn failure_text(&self, condition: BatteryCondition, top: f64, bottom: f64, pv: f64) -> String {
        let c = &self.config;
        match condition {
            BatteryCondition::NightDischarge => format!(
                "Battery: discharging over load at night; PV voltage {pv}V below {}V",
                top + bottom + c.min_diff_for_charge
            ),
            BatteryCondition::TopLow => format!(
                "Top battery: voltage {top}V below {}V",
                c.min_accu_voltage
            ),
            BatteryCondition::BottomLow => format!(
                "Bottom battery: voltage {bottom}V below {}V",
                c.min_accu_voltage
            ),
            BatteryCondition::TopHigh => format!(
                "Top battery: voltage {top}V above {}V",
                c.max_accu_voltage
            ),
            BatteryCondition::BottomHigh => format!(
                "Bottom battery: voltage {bottom}V above {}V",
                c.max_accu_voltage
            ),
            BatteryCondition::Unbalanced => format!(
                "Battery: unbalanced; top {top}V and bottom {bottom}V differ by more than {}V",
                c.max_volt_diff
            ),
        }
    }

    fn fire(&self, violation: BatteryViolation, now: DateTime<Utc>) {
        let condition = violation.condition;
        let corrective = condition.corrective();
        let mut level = self.config.alarm_level;
        let mut action = corrective.describe();
        let mut possible = false;

        if corrective != Corrective::None {
            match self.ctx.switch.load_state() {
                Ok(state) if corrective.is_possible(state) => possible = true,
                Ok(state) => {
                    level = level.escalate();
                    action = corrective.blocked();
                    info!(?condition, relay = %state, "corrective action not possible; escalating");
                }
                Err(err) => {
                    level = level.escalate();
                    action = corrective.blocked();
                    warn!(?condition, error = %err, "load state unreadable; escalating");
                }
            }
        }

        self.ctx
            .ledger
            .raise(Self::alarm_id(condition), level, violation.failure, action, now);
        if possible && self.ctx.authorizes(self.config.alarm_level) {
            corrective.apply(self.ctx.switch.as_ref(), now, false);
        }
    }
}

impl ProtectionPolicy for BatteryProtection {
    fn name(&self) -> &str {
        "Battery"
    }

    fn policy_id(&self) -> u32 {
        BATTERY_BALANCE
    }

    fn poll(&mut self, now: DateTime<Utc>) -> Result<(), ProtectionError> {
        let fired: Vec<BatteryViolation> = self
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
