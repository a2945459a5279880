//! ---
//! bms_section: "04-protection-control"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Protection policies, debounce monitors and load actuation."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use std::fmt;
use std::str::FromStr;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Position of the load relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum RelayState {
    On,
    #[default]
    Off,
}

impl RelayState {
    /// Driver bit: `1` closes the relay.
    pub fn as_bit(self) -> u8 {
        match self {
            RelayState::On => 1,
            RelayState::Off => 0,
        }
    }

    pub fn from_bit(bit: u8) -> Self {
        if bit == 0 {
            RelayState::Off
        } else {
            RelayState::On
        }
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayState::On => f.write_str("ON"),
            RelayState::Off => f.write_str("OFF"),
        }
    }
}

impl FromStr for RelayState {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "ON" => Ok(RelayState::On),
            "OFF" => Ok(RelayState::Off),
            other => Err(RelayError::InvalidReadBack(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("relay driver unavailable: {0}")]
    Unavailable(String),
    #[error("unexpected relay read-back {0:?}")]
    InvalidReadBack(String),
}

/// Driver seam towards the physical relay.
pub trait Relay: Send + Sync {
    fn set_relay(&self, state: RelayState) -> Result<(), RelayError>;

    /// Read back the physical position.
    fn relay_state(&self) -> Result<RelayState, RelayError>;
}

#[derive(Debug, Default)]
struct SimulatedInner {
    state: RelayState,
    commands: usize,
    transitions: usize,
    jammed: bool,
    offline: bool,
}

/// In-memory relay for simulation runs and tests.
///
/// A jammed relay accepts commands but never moves; an offline relay fails
/// every driver call.
#[derive(Debug, Default)]
pub struct SimulatedRelay {
    inner: Mutex<SimulatedInner>,
}

impl SimulatedRelay {
    pub fn new(state: RelayState) -> Self {
        Self {
            inner: Mutex::new(SimulatedInner {
                state,
                ..SimulatedInner::default()
            }),
        }
    }

    pub fn jam(&self, jammed: bool) {
        self.inner.lock().jammed = jammed;
    }

    pub fn set_offline(&self, offline: bool) {
        self.inner.lock().offline = offline;
    }

    /// Commands received, including ones that did not change the position.
    pub fn commands(&self) -> usize {
        self.inner.lock().commands
    }

    /// Physical position changes.
    pub fn transitions(&self) -> usize {
        self.inner.lock().transitions
    }

    pub fn state(&self) -> RelayState {
        self.inner.lock().state
    }
}

impl Relay for SimulatedRelay {
    fn set_relay(&self, state: RelayState) -> Result<(), RelayError> {
        let mut inner = self.inner.lock();
        if inner.offline {
            return Err(RelayError::Unavailable("simulated relay offline".into()));
        }
        inner.commands += 1;
        if inner.jammed {
            debug!(requested = %state, held = %inner.state, "simulated relay jammed");
            return Ok(());
        }
        if inner.state != state {
            inner.transitions += 1;
            inner.state = state;
        }
        Ok(())
    }

    fn relay_state(&self) -> Result<RelayState, RelayError> {
        let inner = self.inner.lock();
        if inner.offline {
            return Err(RelayError::Unavailable("simulated relay offline".into()));
        }
        Ok(inner.state)
    }
}
