//! ---
//! bms_section: "04-protection-control"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Protection policies, debounce monitors and load actuation."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
/// Instantaneous current (A) and voltage (V) of one electrical path.
///
/// A voltage of exactly zero means no reading has arrived yet.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Flow {
    current: f64,
    voltage: f64,
}

impl Flow {
    pub fn new(current: f64, voltage: f64) -> Self {
        let mut flow = Self::default();
        flow.set_current(current);
        flow.set_voltage(voltage);
        flow
    }

    pub fn current(&self) -> f64 {
        self.current
    }

    pub fn voltage(&self) -> f64 {
        self.voltage
    }

    /// Non-finite samples are dropped; returns whether the value was taken.
    pub fn set_current(&mut self, current: f64) -> bool {
        if !current.is_finite() {
            return false;
        }
        self.current = current;
        true
    }

    pub fn set_voltage(&mut self, voltage: f64) -> bool {
        if !voltage.is_finite() {
            return false;
        }
        self.voltage = voltage;
        true
    }

    pub fn has_voltage(&self) -> bool {
        self.voltage != 0.0
    }

    pub fn power(&self) -> f64 {
        self.current * self.voltage
    }
}
