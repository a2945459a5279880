//! ---
//! bms_section: "04-protection-control"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Protection policies, debounce monitors and load actuation."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use std::time::Duration;

use chrono::{DateTime, Utc};
use r_bms_rt::OneShotTimer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    /// Condition seen; waiting for it to hold for the required duration.
    Arming,
    /// Action delivered; re-arming is suppressed until the blackout ends.
    Blackout,
}

/// Sustained-condition debounce with a post-fire blackout.
///
/// The owner reports the condition with [`Monitor::set_active`] and collects
/// the action from [`Monitor::poll`] once the condition has held for the
/// required duration. A zero duration fires on the first poll.
#[derive(Debug)]
pub struct Monitor<A> {
    required: Duration,
    blackout: Duration,
    arming: OneShotTimer,
    blackout_timer: OneShotTimer,
    pending: Option<A>,
    state: MonitorState,
}

impl<A> Monitor<A> {
    pub fn new(required: Duration, blackout: Duration) -> Self {
        Self {
            required,
            blackout,
            arming: OneShotTimer::new(),
            blackout_timer: OneShotTimer::new(),
            pending: None,
            state: MonitorState::Idle,
        }
    }

    pub fn required(&self) -> Duration {
        self.required
    }

    /// Report the condition. Arms from idle and returns `true`; while arming
    /// the pending action is replaced; during blackout this is a no-op.
    pub fn set_active(&mut self, now: DateTime<Utc>, action: A) -> bool {
        self.settle(now);
        match self.state {
            MonitorState::Idle => {
                self.arming.arm(now, self.required);
                self.pending = Some(action);
                self.state = MonitorState::Arming;
                true
            }
            MonitorState::Arming => {
                self.pending = Some(action);
                false
            }
            MonitorState::Blackout => false,
        }
    }

    /// Cancel a pending arming. A blackout that already started runs to completion.
    pub fn clear_active(&mut self) {
        if self.state == MonitorState::Arming {
            self.arming.cancel();
            self.pending = None;
            self.state = MonitorState::Idle;
        }
    }

    /// Advance the clock; returns the action when the arming period elapsed.
    pub fn poll(&mut self, now: DateTime<Utc>) -> Option<A> {
        self.settle(now);
        if self.state == MonitorState::Arming && self.arming.fire_if_due(now) {
            self.state = MonitorState::Blackout;
            self.blackout_timer.arm(now, self.blackout);
            return self.pending.take();
        }
        None
    }

    pub fn is_active(&self) -> bool {
        self.state != MonitorState::Idle
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    fn settle(&mut self, now: DateTime<Utc>) {
        if self.state == MonitorState::Blackout && self.blackout_timer.fire_if_due(now) {
            self.state = MonitorState::Idle;
        }
    }
}
