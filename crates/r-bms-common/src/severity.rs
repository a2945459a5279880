//! ---
//! bms_section: "01-core-functionality"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Shared primitives and utilities for the core runtime."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use std::fmt;

use serde::{Deserialize, Serialize};

/// Severity tier of an alarm.
///
/// Persisted and configured as the integers `0`, `1` and `2`. Levels from
/// [`AlarmLevel::Medium`] upwards are audible.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(try_from = "u8", into = "u8")]
pub enum AlarmLevel {
    #[default]
    Low = 0,
    Medium = 1,
    High = 2,
}

impl AlarmLevel {
    /// One tier louder, saturating at [`AlarmLevel::High`].
    pub fn escalate(self) -> Self {
        match self {
            AlarmLevel::Low => AlarmLevel::Medium,
            AlarmLevel::Medium | AlarmLevel::High => AlarmLevel::High,
        }
    }

    pub fn is_audible(self) -> bool {
        self >= AlarmLevel::Medium
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AlarmLevel::Low => "low",
            AlarmLevel::Medium => "medium",
            AlarmLevel::High => "high",
        }
    }
}

impl TryFrom<u8> for AlarmLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(AlarmLevel::Low),
            1 => Ok(AlarmLevel::Medium),
            2 => Ok(AlarmLevel::High),
            other => Err(format!("alarm level must be 0, 1 or 2 (got {other})")),
        }
    }
}

impl From<AlarmLevel> for u8 {
    fn from(level: AlarmLevel) -> Self {
        level as u8
    }
}

impl fmt::Display for AlarmLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
