//! ---
//! bms_section: "04-protection-control"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Protection policies, debounce monitors and load actuation."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
//! Protection core of R-BMS.
//!
//! Policies receive telemetry with an explicit timestamp, debounce every
//! condition through a [`Monitor`], raise alarms on the shared
//! [`r_bms_alarms::AlarmLedger`] and drive the relay through a [`LoadSwitch`].
//! Nothing in this crate sleeps; owners call `poll(now)` to let timers fire.

pub mod battery;
pub mod charger;
pub mod device;
pub mod flow;
pub mod flow_protection;
pub mod monitor;
pub mod policy;
pub mod relay;
pub mod switch;

pub use battery::{BatteryCondition, BatteryProtection};
pub use charger::{ChargerOverheatProtection, OverheatCondition};
pub use device::{DeviceCondition, DeviceProtection, DeviceStatus};
pub use flow::Flow;
pub use flow_protection::{FlowCondition, FlowProtection};
pub use monitor::{Monitor, MonitorState};
pub use policy::{Corrective, FlowPolicy, PolicyContext, ProtectionError, ProtectionPolicy};
pub use relay::{Relay, RelayError, RelayState, SimulatedRelay};
pub use switch::{LoadSwitch, MonitoredSwitch, SwitchDecision, Switcher};
