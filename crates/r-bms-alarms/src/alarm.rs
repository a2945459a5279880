//! ---
//! bms_section: "02-alarm-management"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Alarm records and the process-wide alarm ledger."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use r_bms_common::AlarmLevel;
use r_bms_rt::OneShotTimer;
use serde::{Deserialize, Serialize};

/// Numeric alarm identifier, `policy_id * 100 + offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlarmId(u32);

impl AlarmId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn compose(policy_id: u32, offset: u32) -> Self {
        Self(policy_id * 100 + offset)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    pub const fn policy_id(self) -> u32 {
        self.0 / 100
    }

    pub const fn offset(self) -> u32 {
        self.0 % 100
    }
}

impl fmt::Display for AlarmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AlarmId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// One alarm occurrence as kept in history and persisted to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alarm {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub time: DateTime<Utc>,
    pub id: AlarmId,
    pub level: AlarmLevel,
    pub failure: String,
    pub action: String,
    pub is_ackn: bool,
    pub is_active: bool,
    pub is_audible: bool,
    /// Restores audibility; silences do not survive a restart.
    #[serde(skip)]
    pub(crate) silence: OneShotTimer,
}

impl Alarm {
    pub fn new(
        id: AlarmId,
        level: AlarmLevel,
        failure: impl Into<String>,
        action: impl Into<String>,
        time: DateTime<Utc>,
    ) -> Self {
        Self {
            time,
            id,
            level,
            failure: failure.into(),
            action: action.into(),
            is_ackn: false,
            is_active: true,
            is_audible: level.is_audible(),
            silence: OneShotTimer::new(),
        }
    }

    /// Active and not yet acknowledged.
    pub fn is_outstanding(&self) -> bool {
        self.is_active && !self.is_ackn
    }

    pub fn is_silenced(&self) -> bool {
        self.silence.is_pending()
    }

    /// Same occurrence, compared at persisted (millisecond) precision.
    pub fn same_occurrence(&self, other: &Alarm) -> bool {
        self.id == other.id && self.time.timestamp_millis() == other.time.timestamp_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_namespaced_by_policy() {
        let id = AlarmId::compose(9, 3);
        assert_eq!(id.get(), 903);
        assert_eq!(id.policy_id(), 9);
        assert_eq!(id.offset(), 3);
        assert_eq!("903".parse::<AlarmId>().unwrap(), id);
    }

    #[test]
    fn persisted_shape_uses_flat_field_names() {
        let time = DateTime::<Utc>::from_timestamp_millis(1_700_000_000_250).unwrap();
        let alarm = Alarm::new(
            AlarmId::compose(1, 0),
            AlarmLevel::High,
            "Bottom battery: too much load -51A",
            "Removing load from battery",
            time,
        );
        let value = serde_json::to_value(&alarm).unwrap();
        assert_eq!(value["time"], 1_700_000_000_250i64);
        assert_eq!(value["id"], 100);
        assert_eq!(value["level"], 2);
        assert_eq!(value["isAckn"], false);
        assert_eq!(value["isActive"], true);
        assert_eq!(value["isAudible"], true);
        assert!(value.get("silence").is_none());
    }

    #[test]
    fn low_alarms_start_silent() {
        let alarm = Alarm::new(AlarmId::new(5), AlarmLevel::Low, "f", "a", Utc::now());
        assert!(!alarm.is_audible);
        assert!(alarm.is_outstanding());
    }
}
