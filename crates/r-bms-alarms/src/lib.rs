//! ---
//! bms_section: "02-alarm-management"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Alarm records and the process-wide alarm ledger."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
//! Alarm bookkeeping for R-BMS.
//!
//! One [`AlarmLedger`] is created per process and shared by handle with every
//! protection policy and with the actuator. Policies refer to alarms only by
//! [`AlarmId`], namespaced as `policy_id * 100 + offset`.

pub mod alarm;
pub mod ledger;

pub use alarm::{Alarm, AlarmId};
pub use ledger::{AlarmLedger, LedgerSettings};
pub use r_bms_common::AlarmLevel;
