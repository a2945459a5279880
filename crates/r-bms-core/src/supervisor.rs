//! ---
//! bms_section: "01-core-functionality"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Telemetry fan-out, supervisor and control loop."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use std::sync::Arc;

use chrono::{DateTime, Utc};
use r_bms_alarms::AlarmLedger;
use r_bms_common::config::{AppConfig, FlowProtectionConfig};
use r_bms_protection::policy::{
    BOTTOM_BATTERY_HP, BOTTOM_BATTERY_LP, CHARGER_HP, CHARGER_LOAD_HP, CHARGER_LOAD_LP,
    CHARGER_LP, TOP_BATTERY_HP, TOP_BATTERY_LP,
};
use r_bms_protection::{
    BatteryProtection, ChargerOverheatProtection, DeviceProtection, FlowPolicy, FlowProtection,
    LoadSwitch, MonitoredSwitch, PolicyContext, ProtectionError, ProtectionPolicy, Relay,
    Switcher,
};
use tracing::{error, info};

use crate::telemetry::{FlowSet, TelemetryFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Bottom,
    Top,
    Charger,
    Load,
    Pv,
}

impl Channel {
    fn pick(self, flows: &FlowSet) -> &r_bms_protection::Flow {
        match self {
            Channel::Bottom => &flows.bottom,
            Channel::Top => &flows.top,
            Channel::Charger => &flows.charger,
            Channel::Load => &flows.load,
            Channel::Pv => &flows.pv,
        }
    }
}

/// Owns every protection policy and drives them from telemetry.
///
/// Failures are isolated per policy: an error is logged and the remaining
/// policies still see the tick.
pub struct BmsSupervisor {
    ledger: Arc<AlarmLedger>,
    switcher: Arc<Switcher>,
    flows: FlowSet,
    flow_policies: Vec<(Channel, Box<dyn FlowPolicy>)>,
    battery: BatteryProtection,
    device: DeviceProtection,
}

impl std::fmt::Debug for BmsSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BmsSupervisor")
            .field("flows", &self.flows)
            .field("flow_policies", &self.flow_policies.len())
            .finish_non_exhaustive()
    }
}

impl BmsSupervisor {
    pub fn from_config(
        config: &AppConfig,
        ledger: Arc<AlarmLedger>,
        relay: Arc<dyn Relay>,
    ) -> Result<Self, ProtectionError> {
        let monitored = Arc::new(MonitoredSwitch::new(relay, ledger.clone(), &config.switch));
        let switcher = Arc::new(Switcher::from_config(monitored, &config.switch));
        let ctx = PolicyContext::new(ledger.clone(), switcher.clone());
        let p = &config.protection;

        let flow = |id: u32,
                    name: &str,
                    section: &FlowProtectionConfig|
         -> Result<Box<dyn FlowPolicy>, ProtectionError> {
            let policy = FlowProtection::new(id, name, section.clone(), ctx.clone())?;
            Ok(Box::new(policy))
        };
        let overheat: Box<dyn FlowPolicy> = Box::new(ChargerOverheatProtection::new(
            "Charger overheat",
            p.charger_overheat_protection_high_priority.clone(),
            ctx.clone(),
        ));
        let battery_lp = &p.battery_protection_low_priority;
        let battery_hp = &p.battery_protection_high_priority;
        let flow_policies: Vec<(Channel, Box<dyn FlowPolicy>)> = vec![
            (Channel::Bottom, flow(BOTTOM_BATTERY_LP, "Bottom battery", battery_lp)?),
            (Channel::Bottom, flow(BOTTOM_BATTERY_HP, "Bottom battery", battery_hp)?),
            (Channel::Top, flow(TOP_BATTERY_LP, "Top battery", battery_lp)?),
            (Channel::Top, flow(TOP_BATTERY_HP, "Top battery", battery_hp)?),
            (
                Channel::Charger,
                flow(CHARGER_LP, "Charger", &p.charger_protection_low_priority)?,
            ),
            (
                Channel::Charger,
                flow(CHARGER_HP, "Charger", &p.charger_protection_high_priority)?,
            ),
            (
                Channel::Load,
                flow(CHARGER_LOAD_LP, "Charger load", &p.charger_load_protection_low_priority)?,
            ),
            (
                Channel::Load,
                flow(CHARGER_LOAD_HP, "Charger load", &p.charger_load_protection_high_priority)?,
            ),
            (Channel::Pv, overheat),
        ];

        let battery = BatteryProtection::new(p.battery_protection.clone(), ctx.clone());
        let device = DeviceProtection::new(p.device_protection.clone(), ctx);
        info!(policies = flow_policies.len() + 2, "protection policies configured");

        Ok(Self {
            ledger,
            switcher,
            flows: FlowSet::default(),
            flow_policies,
            battery,
            device,
        })
    }

    pub fn ledger(&self) -> &Arc<AlarmLedger> {
        &self.ledger
    }

    pub fn switcher(&self) -> &Arc<Switcher> {
        &self.switcher
    }

    pub fn flows(&self) -> &FlowSet {
        &self.flows
    }

    /// Process one frame at its own timestamp.
    pub fn ingest(&mut self, frame: &TelemetryFrame) {
        self.ingest_at(frame, frame.timestamp);
    }

    /// Evaluate `frame` at `now` instead of its own timestamp.
    pub fn ingest_at(&mut self, frame: &TelemetryFrame, now: DateTime<Utc>) {
        self.flows.apply(frame);

        for (channel, policy) in self.flow_policies.iter_mut() {
            let flow = channel.pick(&self.flows);
            if let Err(err) = policy.set_flow(flow, now) {
                error!(policy = policy.name(), policy_id = policy.policy_id(), error = %err, "flow policy failed");
            }
        }

        let (top, bottom, pv) = (
            self.flows.top.voltage(),
            self.flows.bottom.voltage(),
            self.flows.pv.voltage(),
        );
        if let Err(err) = self.battery.set_voltages(top, bottom, pv, now) {
            error!(policy = self.battery.name(), error = %err, "battery policy failed");
        }
        if let Err(err) = self.device.apply(&frame.device, now) {
            error!(policy = self.device.name(), error = %err, "device policy failed");
        }
        self.poll(now);
    }

    /// Fire every due timer: actuator, alarm silences and policy monitors.
    pub fn poll(&mut self, now: DateTime<Utc>) {
        self.switcher.poll(now);
        self.ledger.poll(now);
        for (_, policy) in self.flow_policies.iter_mut() {
            report(policy.as_mut(), now);
        }
        report(&mut self.battery, now);
        report(&mut self.device, now);
    }
}

fn report<P: ProtectionPolicy + ?Sized>(policy: &mut P, now: DateTime<Utc>) {
    if let Err(err) = policy.poll(now) {
        error!(policy = policy.name(), policy_id = policy.policy_id(), error = %err, "policy poll failed");
    }
}
