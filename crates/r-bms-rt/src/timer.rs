//! ---
//! bms_section: "01-core-functionality"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Runtime helpers supporting the control loop."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use std::time::Duration;

use chrono::{DateTime, Utc};
use r_bms_common::time::after;

/// Cancellable deferred trigger driven by an explicit clock.
///
/// Arming replaces any earlier deadline. The timer fires at most once per
/// arming: [`OneShotTimer::fire_if_due`] disarms it when it reports `true`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OneShotTimer {
    due: Option<DateTime<Utc>>,
}

impl OneShotTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm to fire `delay` after `now` and return the deadline.
    pub fn arm(&mut self, now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
        let due = after(now, delay);
        self.due = Some(due);
        due
    }

    pub fn arm_at(&mut self, due: DateTime<Utc>) {
        self.due = Some(due);
    }

    /// Disarm; returns whether a deadline was pending.
    pub fn cancel(&mut self) -> bool {
        self.due.take().is_some()
    }

    pub fn is_pending(&self) -> bool {
        self.due.is_some()
    }

    pub fn due(&self) -> Option<DateTime<Utc>> {
        self.due
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.due
            .map(|due| (due - now).to_std().unwrap_or(Duration::ZERO))
    }

    pub fn fire_if_due(&mut self, now: DateTime<Utc>) -> bool {
        match self.due {
            Some(due) if due <= now => {
                self.due = None;
                true
            }
            _ => false,
        }
    }
}
