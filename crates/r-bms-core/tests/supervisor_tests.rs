//! ---
//! bms_section: "01-core-functionality"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Integration tests for the supervisor and control loop."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use r_bms_alarms::{AlarmId, AlarmLedger, AlarmLevel};
use r_bms_common::config::AppConfig;
use r_bms_common::time::after;
use r_bms_core::{BmsRuntime, BmsSupervisor, TelemetryFrame};
use r_bms_protection::{RelayState, SimulatedRelay};
use tempfile::tempdir;

const EXAMPLE: &str = include_str!("../../../configs/r-bms.example.toml");

fn t0() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
}

fn config_in(dir: &std::path::Path) -> AppConfig {
    let mut config: AppConfig = EXAMPLE.parse().unwrap();
    config.alarms.file = dir.join("alarms.json");
    config.alarms.journal = Some(dir.join("alarms.journal"));
    config
}

/// Healthy 24V chain with a heavy discharge current.
fn overload_frame(at: DateTime<Utc>) -> TelemetryFrame {
    let mut frame = TelemetryFrame::at(at);
    frame.mid_voltage = Some(12.6);
    frame.top_voltage = Some(12.6);
    frame.upper_voltage = Some(25.2);
    frame.mppt_battery_voltage = Some(25.2);
    frame.mppt_pv_voltage = Some(30.0);
    frame.battery_current = Some(-110.0);
    frame.mppt_charging_current = Some(2.0);
    frame.mppt_load_current = Some(3.0);
    frame
}

#[test]
fn sustained_pack_overload_raises_high_alarms_and_removes_load() {
    let dir = tempdir().unwrap();
    let config = config_in(dir.path());
    let ledger = Arc::new(AlarmLedger::from_config(&config.alarms).unwrap());
    let relay = Arc::new(SimulatedRelay::new(RelayState::On));
    let mut supervisor = BmsSupervisor::from_config(&config, ledger.clone(), relay.clone()).unwrap();

    supervisor.ingest(&overload_frame(t0()));
    assert!(ledger.is_empty());
    assert_eq!(supervisor.flows().bottom.current(), -55.0);

    supervisor.ingest(&overload_frame(after(t0(), Duration::from_secs(10))));
    for id in [AlarmId::compose(1, 0), AlarmId::compose(3, 0)] {
        let alarm = ledger.find(id).expect("high priority pack alarm");
        assert_eq!(alarm.level, AlarmLevel::High);
    }
    assert!(ledger.is_any_audible());
    assert_eq!(relay.state(), RelayState::Off);
    assert_eq!(relay.transitions(), 1);
}

#[test]
fn device_short_circuit_from_telemetry_forces_disconnect() {
    let dir = tempdir().unwrap();
    let config = config_in(dir.path());
    let ledger = Arc::new(AlarmLedger::from_config(&config.alarms).unwrap());
    let relay = Arc::new(SimulatedRelay::new(RelayState::On));
    let mut supervisor = BmsSupervisor::from_config(&config, ledger.clone(), relay.clone()).unwrap();

    let mut frame = TelemetryFrame::at(t0());
    frame.device.is_short_circuit = Some(true);
    supervisor.ingest(&frame);

    assert_eq!(relay.state(), RelayState::Off);
    assert!(ledger.find(AlarmId::compose(10, 1)).unwrap().is_active);
}

#[test]
fn poll_runs_verification_without_telemetry() {
    let dir = tempdir().unwrap();
    let config = config_in(dir.path());
    let ledger = Arc::new(AlarmLedger::from_config(&config.alarms).unwrap());
    let relay = Arc::new(SimulatedRelay::new(RelayState::On));
    relay.jam(true);
    let mut supervisor = BmsSupervisor::from_config(&config, ledger.clone(), relay.clone()).unwrap();

    let mut frame = TelemetryFrame::at(t0());
    frame.device.is_overload = Some(true);
    supervisor.ingest(&frame);
    assert!(ledger.find(AlarmId::compose(11, 0)).is_none());

    supervisor.poll(after(t0(), config.switch.monitor_time_in_s));
    assert!(ledger.find(AlarmId::compose(11, 0)).is_some());
}

#[tokio::test]
async fn runtime_processes_queued_frames_and_persists_on_shutdown() {
    let dir = tempdir().unwrap();
    let config = config_in(dir.path());
    let ledger = Arc::new(AlarmLedger::from_config(&config.alarms).unwrap());
    let relay = Arc::new(SimulatedRelay::new(RelayState::On));
    let supervisor = BmsSupervisor::from_config(&config, ledger, relay.clone()).unwrap();

    let handle = BmsRuntime::new(supervisor, &config.telemetry).start();
    let sender = handle.sender();
    sender.send(overload_frame(t0())).await.unwrap();
    sender
        .send(overload_frame(after(t0(), Duration::from_secs(10))))
        .await
        .unwrap();
    drop(sender);

    let supervisor = handle.shutdown().await.unwrap();
    assert_eq!(supervisor.ledger().len(), 2);
    assert_eq!(relay.state(), RelayState::Off);

    let restored = AlarmLedger::from_config(&config.alarms).unwrap();
    assert_eq!(restored.load(), 2);
    assert!(restored.is_any_active());
}

fn healthy_frame(at: DateTime<Utc>) -> TelemetryFrame {
    let mut frame = overload_frame(at);
    frame.battery_current = Some(-10.0);
    frame
}

#[tokio::test(start_paused = true)]
async fn frames_arriving_late_are_still_processed_in_order() {
    let dir = tempdir().unwrap();
    let config = config_in(dir.path());
    let ledger = Arc::new(AlarmLedger::from_config(&config.alarms).unwrap());
    let relay = Arc::new(SimulatedRelay::new(RelayState::On));
    let supervisor = BmsSupervisor::from_config(&config, ledger, relay.clone()).unwrap();

    let handle = BmsRuntime::new(supervisor, &config.telemetry).start();
    let sender = handle.sender();
    sender.send(overload_frame(t0())).await.unwrap();
    for tick in 1..=9u64 {
        tokio::time::sleep(Duration::from_millis(2_050)).await;
        sender
            .send(healthy_frame(after(t0(), Duration::from_secs(2 * tick))))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(500)).await;
    drop(sender);

    let supervisor = handle.shutdown().await.unwrap();
    assert_eq!(supervisor.flows().bottom.current(), -5.0);
    assert!(supervisor.ledger().is_empty());
    assert_eq!(relay.state(), RelayState::On);
    assert_eq!(relay.transitions(), 0);
}

#[tokio::test(start_paused = true)]
async fn frame_older_than_the_last_one_is_dropped() {
    let dir = tempdir().unwrap();
    let config = config_in(dir.path());
    let ledger = Arc::new(AlarmLedger::from_config(&config.alarms).unwrap());
    let relay = Arc::new(SimulatedRelay::new(RelayState::On));
    let supervisor = BmsSupervisor::from_config(&config, ledger, relay).unwrap();

    let handle = BmsRuntime::new(supervisor, &config.telemetry).start();
    let sender = handle.sender();
    sender
        .send(healthy_frame(after(t0(), Duration::from_secs(4))))
        .await
        .unwrap();
    sender.send(overload_frame(t0())).await.unwrap();
    drop(sender);

    let supervisor = handle.shutdown().await.unwrap();
    assert_eq!(supervisor.flows().bottom.current(), -5.0);
}
