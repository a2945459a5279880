//! ---
//! bms_section: "01-core-functionality"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Telemetry fan-out, supervisor and control loop."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use r_bms_protection::{DeviceStatus, Flow};
use serde::{Deserialize, Serialize};

/// One telemetry update from the battery monitor and charger.
///
/// Readings absent from a frame leave the previous value in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryFrame {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    /// Bottom pack voltage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid_voltage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_voltage: Option<f64>,
    /// Voltage over the whole chain as seen by the battery monitor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper_voltage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mppt_battery_voltage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mppt_pv_voltage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_current: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mppt_charging_current: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mppt_load_current: Option<f64>,
    #[serde(flatten)]
    pub device: DeviceStatus,
}

impl TelemetryFrame {
    pub fn at(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            ..Self::default()
        }
    }
}

/// Electrical paths derived from telemetry.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FlowSet {
    pub bottom: Flow,
    pub top: Flow,
    pub charger: Flow,
    pub load: Flow,
    pub pv: Flow,
}

impl FlowSet {
    /// Fold one frame into the flows.
    pub fn apply(&mut self, frame: &TelemetryFrame) {
        if let Some(u) = frame.mid_voltage {
            self.bottom.set_voltage(u);
        }
        if let Some(u) = frame.top_voltage {
            self.top.set_voltage(u);
        }
        if let Some(u) = chain_voltage(frame.upper_voltage, frame.mppt_battery_voltage) {
            self.charger.set_voltage(u);
            self.load.set_voltage(u);
        }
        if let Some(u) = frame.mppt_pv_voltage {
            self.pv.set_voltage(u);
        }
        if let Some(i) = frame.battery_current {
            // both packs carry the chain current; the monitor reports it once
            self.bottom.set_current(i / 2.0);
            self.top.set_current(i / 2.0);
        }
        if let Some(i) = frame.mppt_charging_current {
            self.charger.set_current(i);
            self.pv.set_current(i);
        }
        if let Some(i) = frame.mppt_load_current {
            self.load.set_current(-i);
        }
    }
}

fn chain_voltage(monitor: Option<f64>, charger: Option<f64>) -> Option<f64> {
    let finite = |v: Option<f64>| v.filter(|v| v.is_finite());
    match (finite(monitor), finite(charger)) {
        (Some(a), Some(b)) => Some((a + b) / 2.0),
        (Some(v), None) | (None, Some(v)) => Some(v),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_fans_out_to_flows() {
        let frame: TelemetryFrame = serde_json::from_str(
            r#"{"timestamp":1700000000000,"midVoltage":12.5,"topVoltage":12.7,
                "upperVoltage":25.2,"mpptBatteryVoltage":25.4,"mpptPvVoltage":31.0,
                "batteryCurrent":-8.0,"mpptChargingCurrent":3.5,"mpptLoadCurrent":6.0}"#,
        )
        .unwrap();
        let mut flows = FlowSet::default();
        flows.apply(&frame);

        assert_eq!(flows.bottom, Flow::new(-4.0, 12.5));
        assert_eq!(flows.top, Flow::new(-4.0, 12.7));
        assert!((flows.charger.voltage() - 25.3).abs() < 1e-9);
        assert_eq!(flows.charger.current(), 3.5);
        assert_eq!(flows.load.current(), -6.0);
        assert_eq!(flows.pv, Flow::new(3.5, 31.0));
    }

    #[test]
    fn partial_frames_keep_previous_readings() {
        let mut flows = FlowSet::default();
        let mut frame = TelemetryFrame::at(Utc::now());
        frame.mid_voltage = Some(12.4);
        flows.apply(&frame);

        let mut next = TelemetryFrame::at(Utc::now());
        next.mppt_battery_voltage = Some(24.9);
        next.mid_voltage = Some(f64::NAN);
        flows.apply(&next);

        assert_eq!(flows.bottom.voltage(), 12.4);
        assert_eq!(flows.load.voltage(), 24.9);
    }

    #[test]
    fn device_bits_are_read_from_the_same_object() {
        let frame: TelemetryFrame = serde_json::from_str(
            r#"{"timestamp":1700000000000,"isShortCircuit":true,"alarmReason":5}"#,
        )
        .unwrap();
        assert_eq!(frame.device.is_short_circuit, Some(true));
        assert_eq!(frame.device.alarm_reason, Some(5));
        assert_eq!(frame.device.is_full, None);
    }
}
