//! ---
//! bms_section: "02-alarm-management"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Alarm records and the process-wide alarm ledger."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use r_bms_alarms::{AlarmId, AlarmLedger, AlarmLevel, LedgerSettings};
use r_bms_common::config::AlarmsConfig;
use r_bms_common::time::after;
use tempfile::tempdir;

fn t0() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
}

fn settings(history: usize) -> LedgerSettings {
    LedgerSettings {
        history,
        ..LedgerSettings::default()
    }
}

#[test]
fn second_raise_of_outstanding_alarm_is_rejected() {
    let ledger = AlarmLedger::new(settings(20));
    let id = AlarmId::compose(1, 0);
    assert!(ledger.raise(id, AlarmLevel::High, "too much load", "Removing load", t0()));
    assert!(!ledger.raise(id, AlarmLevel::High, "too much load", "Removing load", t0()));
    assert_eq!(ledger.entries().iter().filter(|a| a.id == id).count(), 1);
}

#[test]
fn outstanding_alarm_blocks_raise_even_after_cooldown() {
    let ledger = AlarmLedger::new(settings(20));
    let id = AlarmId::new(4);
    ledger.raise(id, AlarmLevel::Medium, "f", "a", t0());
    assert!(!ledger.raise(
        id,
        AlarmLevel::Medium,
        "f",
        "a",
        after(t0(), Duration::from_secs(3600))
    ));
}

#[test]
fn clear_requires_acknowledgement_unless_forced() {
    let ledger = AlarmLedger::new(settings(20));
    let id = AlarmId::compose(2, 1);
    ledger.raise(id, AlarmLevel::Medium, "f", "a", t0());

    ledger.clear(id, false, t0());
    assert!(ledger.find(id).unwrap().is_active);

    ledger.acknowledge(id, t0());
    ledger.clear(id, false, t0());
    let alarm = ledger.find(id).unwrap();
    assert!(!alarm.is_active);
    assert!(!alarm.is_audible);
    assert!(alarm.is_ackn);
}

#[test]
fn cooldown_suppresses_quick_re_raise() {
    let ledger = AlarmLedger::new(settings(20));
    let id = AlarmId::new(10);
    ledger.raise(id, AlarmLevel::Medium, "f", "a", t0());
    ledger.clear(id, true, t0());

    assert!(!ledger.raise(
        id,
        AlarmLevel::Medium,
        "f",
        "a",
        after(t0(), Duration::from_secs(300))
    ));
    assert!(ledger.raise(
        id,
        AlarmLevel::Medium,
        "f",
        "a",
        after(t0(), Duration::from_millis(300_001))
    ));
    assert_eq!(ledger.len(), 2);
    assert!(ledger.recent_alarm().unwrap().is_active);
}

#[test]
fn history_is_trimmed_but_active_alarms_are_retained() {
    let history = 5;
    let ledger = AlarmLedger::new(settings(history));
    for n in 0..(history as u32 + 5) {
        assert!(ledger.raise(AlarmId::new(n), AlarmLevel::High, "f", "a", t0()));
    }
    assert_eq!(ledger.len(), history + 5);

    for n in 0..(history as u32 + 5) {
        ledger.clear(AlarmId::new(n), true, t0());
    }
    assert_eq!(ledger.len(), history);
    // oldest inactive entries go first
    let ids: Vec<_> = ledger.entries().iter().map(|a| a.id.get()).collect();
    assert_eq!(ids, vec![9, 8, 7, 6, 5]);
}

#[test]
fn aggregate_queries_follow_state() {
    let ledger = AlarmLedger::new(settings(20));
    assert!(!ledger.is_any_active());
    ledger.raise(AlarmId::new(1), AlarmLevel::Low, "f", "a", t0());
    assert!(ledger.is_any_active());
    assert!(!ledger.is_any_audible());
    ledger.raise(AlarmId::new(2), AlarmLevel::High, "f", "a", t0());
    assert!(ledger.is_any_audible());
    ledger.silence(AlarmId::new(2), t0());
    assert!(!ledger.is_any_audible());
}

#[test]
fn plain_rendering_marks_inactive_and_hides_minor_actions() {
    let ledger = AlarmLedger::new(settings(20));
    assert_eq!(ledger.persist_plain("\t"), "No alarms");

    let at = DateTime::<Utc>::from_timestamp(1_700_000_000 + 3_600, 0).unwrap();
    ledger.raise(AlarmId::new(1), AlarmLevel::Low, "pack warm", "Check fan", at);
    ledger.raise(
        AlarmId::new(2),
        AlarmLevel::High,
        "too much load",
        "Removing load",
        after(at, Duration::from_secs(60)),
    );
    ledger.clear(AlarmId::new(2), true, at);

    let rendered = ledger.persist_plain(",");
    let lines: Vec<_> = rendered.lines().collect();
    assert_eq!(lines[0], "23:14,(high),too much load,Removing load");
    assert_eq!(lines[1], "23:13,low,pack warm,");
}

#[test]
fn persisted_history_round_trips() {
    let dir = tempdir().unwrap();
    let config = AlarmsConfig {
        file: dir.path().join("alarms.json"),
        ..AlarmsConfig::default()
    };

    let ledger = AlarmLedger::from_config(&config).unwrap();
    ledger.raise(AlarmId::new(100), AlarmLevel::High, "a", "b", t0());
    ledger.raise(AlarmId::new(203), AlarmLevel::Low, "c", "d", t0());
    ledger.acknowledge(AlarmId::new(203), t0());
    ledger.raise(AlarmId::new(905), AlarmLevel::Medium, "e", "f", t0());
    ledger.clear(AlarmId::new(905), true, t0());
    ledger.persist().unwrap();

    let restored = AlarmLedger::from_config(&config).unwrap();
    assert_eq!(restored.load(), 3);

    let key = |ledger: &AlarmLedger| -> BTreeSet<(u32, u8, bool, bool)> {
        ledger
            .entries()
            .iter()
            .map(|a| (a.id.get(), u8::from(a.level), a.is_active, a.is_ackn))
            .collect()
    };
    assert_eq!(key(&ledger), key(&restored));
}

#[test]
fn corrupt_history_starts_empty() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("alarms.json");
    std::fs::write(&path, "not json").unwrap();
    let config = AlarmsConfig {
        file: path,
        ..AlarmsConfig::default()
    };
    let ledger = AlarmLedger::from_config(&config).unwrap();
    assert_eq!(ledger.load(), 0);
    assert_eq!(ledger.persist_plain("\t"), "No alarms");
}

#[test]
fn journal_recovers_alarms_after_a_crash() {
    let dir = tempdir().unwrap();
    let config = AlarmsConfig {
        file: dir.path().join("alarms.json"),
        journal: Some(dir.path().join("alarms.journal")),
        ..AlarmsConfig::default()
    };

    {
        let ledger = AlarmLedger::from_config(&config).unwrap();
        ledger.raise(AlarmId::new(300), AlarmLevel::High, "kept", "x", t0());
        ledger.persist().unwrap();
        // no persist after this point: the process "crashes"
        ledger.raise(
            AlarmId::new(301),
            AlarmLevel::High,
            "journal only",
            "y",
            after(t0(), Duration::from_secs(1)),
        );
        ledger.acknowledge(AlarmId::new(300), t0());
    }

    let recovered = AlarmLedger::from_config(&config).unwrap();
    assert_eq!(recovered.load(), 2);
    assert!(recovered.find(AlarmId::new(300)).unwrap().is_ackn);
    assert_eq!(recovered.recent_alarm().unwrap().id, AlarmId::new(301));
}

#[test]
fn read_only_ledger_sees_journal_without_writing() {
    let dir = tempdir().unwrap();
    let journal = dir.path().join("alarms.journal");
    let config = AlarmsConfig {
        file: dir.path().join("alarms.json"),
        journal: Some(journal.clone()),
        ..AlarmsConfig::default()
    };

    let untouched = AlarmLedger::read_only(&config);
    assert_eq!(untouched.load(), 0);
    assert!(!journal.exists());

    {
        let ledger = AlarmLedger::from_config(&config).unwrap();
        ledger.raise(AlarmId::new(1100), AlarmLevel::High, "relay stuck", "z", t0());
    }
    let before = std::fs::read(&journal).unwrap();

    let viewer = AlarmLedger::read_only(&config);
    assert_eq!(viewer.load(), 1);
    assert!(viewer.persist_plain("|").contains("relay stuck"));
    assert_eq!(std::fs::read(&journal).unwrap(), before);
    assert!(!config.file.exists());
}
