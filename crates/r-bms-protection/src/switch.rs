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
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use parking_lot::Mutex;
use r_bms_alarms::{AlarmId, AlarmLedger, AlarmLevel};
use r_bms_common::config::SwitchConfig;
use r_bms_common::time::{after, elapsed};
use r_bms_rt::OneShotTimer;
use tracing::{debug, error, info, warn};

pub use crate::policy::ACTUATOR_POLICY_ID;

use crate::relay::{Relay, RelayError, RelayState};

/// Read-back after `monitorTime` disagreed with the command.
pub const VERIFICATION_ALARM: AlarmId = AlarmId::compose(ACTUATOR_POLICY_ID, 0);
/// The driver rejected a command or could not be read.
pub const DRIVER_ALARM: AlarmId = AlarmId::compose(ACTUATOR_POLICY_ID, 1);

/// Load actuation capability handed to protection policies.
pub trait LoadSwitch: Send + Sync {
    /// Connect the load. `force` bypasses request coalescing.
    fn switch_load(&self, now: DateTime<Utc>, force: bool);

    /// Disconnect the load. `force` bypasses request coalescing.
    fn remove_load(&self, now: DateTime<Utc>, force: bool);

    fn load_state(&self) -> Result<RelayState, RelayError>;

    fn is_load_on(&self) -> Result<bool, RelayError> {
        Ok(self.load_state()? == RelayState::On)
    }

    /// Fire due verification, sunset and deferred-switch timers.
    fn poll(&self, now: DateTime<Utc>);
}

#[derive(Debug, Default)]
struct SwitchInner {
    verification: OneShotTimer,
    expected: Option<RelayState>,
    sunset: OneShotTimer,
    remove_load_time: Option<DateTime<Utc>>,
}

/// Relay wrapper that verifies every command after `monitor_time`.
///
/// A mismatch between read-back and command raises a High alarm on the
/// ledger; it is never silently dropped.
pub struct MonitoredSwitch {
    relay: Arc<dyn Relay>,
    ledger: Arc<AlarmLedger>,
    monitor_time: Duration,
    min_on_time: Duration,
    daily_disconnect: Option<NaiveTime>,
    inner: Mutex<SwitchInner>,
}

impl std::fmt::Debug for MonitoredSwitch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitoredSwitch")
            .field("monitor_time", &self.monitor_time)
            .field("min_on_time", &self.min_on_time)
            .field("daily_disconnect", &self.daily_disconnect)
            .field("inner", &self.inner)
            .finish()
    }
}

impl MonitoredSwitch {
    pub fn new(relay: Arc<dyn Relay>, ledger: Arc<AlarmLedger>, config: &SwitchConfig) -> Self {
        Self {
            relay,
            ledger,
            monitor_time: config.monitor_time_in_s,
            min_on_time: config.min_on_time(),
            daily_disconnect: config.daily_disconnect(),
            inner: Mutex::new(SwitchInner::default()),
        }
    }

    /// Schedule the sunset disconnect, or disable it with `None`.
    ///
    /// While set, [`MonitoredSwitch::switch_load`] refuses to connect the
    /// load when less than the minimum ON time remains. With
    /// `removeLoadAtUtc` configured a passed time rolls to the next day.
    pub fn set_remove_load_time(&self, remove_at: Option<DateTime<Utc>>) {
        let mut inner = self.inner.lock();
        inner.remove_load_time = remove_at;
        match remove_at {
            Some(at) => {
                inner.sunset.arm_at(at);
                info!(remove_load_at = %at, "sunset load removal scheduled");
            }
            None => {
                inner.sunset.cancel();
            }
        }
    }

    pub fn remove_load_time(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().remove_load_time
    }

    /// Returns whether the relay was commanded.
    pub fn switch_load(&self, now: DateTime<Utc>) -> bool {
        let mut inner = self.inner.lock();
        self.roll_daily(&mut inner, now);
        if let Some(remove_at) = inner.remove_load_time {
            let remaining = if remove_at > now {
                elapsed(now, remove_at)
            } else {
                Duration::ZERO
            };
            if remaining <= self.min_on_time {
                debug!(remaining_s = remaining.as_secs(), "too close to sunset; load stays off");
                return false;
            }
            inner.sunset.arm_at(remove_at);
        }
        self.set_load(&mut inner, RelayState::On, now)
    }

    pub fn remove_load(&self, now: DateTime<Utc>) -> bool {
        let mut inner = self.inner.lock();
        inner.sunset.cancel();
        self.set_load(&mut inner, RelayState::Off, now)
    }

    pub fn relay_state(&self) -> Result<RelayState, RelayError> {
        self.relay.relay_state()
    }

    pub fn verification_due(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().verification.due()
    }

    pub fn poll(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        if inner.verification.fire_if_due(now) {
            if let Some(expected) = inner.expected {
                self.verify(expected, now);
            }
        }
        if inner.sunset.fire_if_due(now) {
            info!("sunset reached; removing load");
            self.set_load(&mut inner, RelayState::Off, now);
        }
        self.roll_daily(&mut inner, now);
    }

    fn roll_daily(&self, inner: &mut SwitchInner, now: DateTime<Utc>) {
        let Some(time) = self.daily_disconnect else {
            return;
        };
        if inner.remove_load_time.is_some_and(|at| at > now) {
            return;
        }
        let today = now.date_naive().and_time(time).and_utc();
        let next = if today > now {
            today
        } else {
            today + chrono::Duration::days(1)
        };
        inner.remove_load_time = Some(next);
        if inner.expected == Some(RelayState::On) {
            inner.sunset.arm_at(next);
        }
        debug!(remove_load_at = %next, "daily load disconnect scheduled");
    }

    fn set_load(&self, inner: &mut SwitchInner, state: RelayState, now: DateTime<Utc>) -> bool {
        debug!(relay = %state, "commanding load relay");
        inner.verification.cancel();
        if let Err(err) = self.relay.set_relay(state) {
            error!(relay = %state, error = %err, "load relay command failed");
            self.ledger.raise(
                DRIVER_ALARM,
                AlarmLevel::High,
                format!("Load switch: command {state} failed: {err}"),
                "Check relay driver and wiring",
                now,
            );
            inner.expected = None;
            return false;
        }
        inner.expected = Some(state);
        inner.verification.arm(now, self.monitor_time);
        true
    }

    fn verify(&self, expected: RelayState, now: DateTime<Utc>) {
        match self.relay.relay_state() {
            Ok(actual) if actual == expected => {
                debug!(relay = %actual, "load relay verified");
            }
            Ok(actual) => {
                error!(expected = %expected, actual = %actual, after_s = self.monitor_time.as_secs(), "load switch verification failed");
                self.ledger.raise(
                    VERIFICATION_ALARM,
                    AlarmLevel::High,
                    format!(
                        "Load switch failed after {}s: load is {actual} while it should be {expected}",
                        self.monitor_time.as_secs()
                    ),
                    "Check relay and load wiring",
                    now,
                );
            }
            Err(err) => {
                error!(expected = %expected, error = %err, "load relay read-back failed");
                self.ledger.raise(
                    DRIVER_ALARM,
                    AlarmLevel::High,
                    format!("Load switch: read-back failed: {err}"),
                    "Check relay driver and wiring",
                    now,
                );
            }
        }
    }
}

impl LoadSwitch for MonitoredSwitch {
    fn switch_load(&self, now: DateTime<Utc>, _force: bool) {
        MonitoredSwitch::switch_load(self, now);
    }

    fn remove_load(&self, now: DateTime<Utc>, _force: bool) {
        MonitoredSwitch::remove_load(self, now);
    }

    fn load_state(&self) -> Result<RelayState, RelayError> {
        self.relay_state()
    }

    fn poll(&self, now: DateTime<Utc>) {
        MonitoredSwitch::poll(self, now);
    }
}

/// Outcome of a [`Switcher`] request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchDecision {
    Executed,
    /// Scheduled for the end of the dwell window.
    Deferred,
    /// Folded into an already scheduled switch; the latest mode wins.
    Coalesced,
}

#[derive(Debug, Default)]
struct SwitcherInner {
    last_time: Option<DateTime<Utc>>,
    last_mode: Option<RelayState>,
    deferred: OneShotTimer,
}

/// Coalesces switch requests so the relay moves at most once per
/// `min_duration` window.
#[derive(Debug)]
pub struct Switcher {
    switch: Arc<MonitoredSwitch>,
    min_duration: Duration,
    inner: Mutex<SwitcherInner>,
}

impl Switcher {
    pub fn new(switch: Arc<MonitoredSwitch>, min_duration: Duration) -> Self {
        Self {
            switch,
            min_duration,
            inner: Mutex::new(SwitcherInner::default()),
        }
    }

    pub fn from_config(switch: Arc<MonitoredSwitch>, config: &SwitchConfig) -> Self {
        Self::new(switch, config.min_duration_between_switches())
    }

    pub fn monitored(&self) -> &Arc<MonitoredSwitch> {
        &self.switch
    }

    pub fn request(&self, mode: RelayState, force: bool, now: DateTime<Utc>) -> SwitchDecision {
        let mut inner = self.inner.lock();
        inner.last_mode = Some(mode);

        if force {
            if inner.deferred.cancel() {
                warn!(relay = %mode, "forced switch overrides deferred request");
            }
            inner.last_time = Some(now);
            self.execute(mode, now);
            return SwitchDecision::Executed;
        }
        if inner.deferred.is_pending() {
            debug!(relay = %mode, "switch request coalesced");
            return SwitchDecision::Coalesced;
        }
        match inner.last_time {
            Some(last) if elapsed(last, now) < self.min_duration => {
                inner.deferred.arm_at(after(last, self.min_duration));
                debug!(relay = %mode, "switch request deferred");
                SwitchDecision::Deferred
            }
            _ => {
                inner.last_time = Some(now);
                self.execute(mode, now);
                SwitchDecision::Executed
            }
        }
    }

    pub fn pending_mode(&self) -> Option<RelayState> {
        let inner = self.inner.lock();
        inner
            .deferred
            .is_pending()
            .then_some(inner.last_mode)
            .flatten()
    }

    fn execute(&self, mode: RelayState, now: DateTime<Utc>) {
        match mode {
            RelayState::On => {
                self.switch.switch_load(now);
            }
            RelayState::Off => {
                self.switch.remove_load(now);
            }
        }
    }
}

impl LoadSwitch for Switcher {
    fn switch_load(&self, now: DateTime<Utc>, force: bool) {
        self.request(RelayState::On, force, now);
    }

    fn remove_load(&self, now: DateTime<Utc>, force: bool) {
        self.request(RelayState::Off, force, now);
    }

    fn load_state(&self) -> Result<RelayState, RelayError> {
        self.switch.relay_state()
    }

    fn poll(&self, now: DateTime<Utc>) {
        {
            let mut inner = self.inner.lock();
            if inner.deferred.fire_if_due(now) {
                if let Some(mode) = inner.last_mode {
                    inner.last_time = Some(now);
                    self.execute(mode, now);
                }
            }
        }
        self.switch.poll(now);
    }
}
