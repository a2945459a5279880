//! ---
//! bms_section: "02-alarm-management"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Alarm records and the process-wide alarm ledger."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use r_bms_common::config::AlarmsConfig;
use r_bms_common::logging::ALARM_TARGET;
use r_bms_common::time::elapsed;
use r_bms_common::AlarmLevel;
use r_bms_persistence::{
    replay_journal, HistoryStore, JournalEntry, JournalWriter, PersistenceError,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::alarm::{Alarm, AlarmId};

/// Tunables of an [`AlarmLedger`].
#[derive(Debug, Clone)]
pub struct LedgerSettings {
    pub history: usize,
    pub silence: Duration,
    pub cooldown: Duration,
    pub action_level: AlarmLevel,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self::from(&AlarmsConfig::default())
    }
}

impl From<&AlarmsConfig> for LedgerSettings {
    fn from(config: &AlarmsConfig) -> Self {
        Self {
            history: config.history.max(1),
            silence: config.silence_duration(),
            cooldown: config.cooldown(),
            action_level: config.action_level,
        }
    }
}

/// Ledger mutations as written to the journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum LedgerEvent {
    Raise { alarm: Alarm },
    Acknowledge { id: AlarmId },
    Clear { id: AlarmId, force: bool },
    Silence { id: AlarmId },
}

#[derive(Debug, Default)]
struct LedgerInner {
    /// Most recent first.
    history: Vec<Alarm>,
    journal: Option<JournalWriter>,
}

impl LedgerInner {
    fn latest_mut(&mut self, id: AlarmId) -> Option<&mut Alarm> {
        self.history.iter_mut().find(|alarm| alarm.id == id)
    }

    fn record(&mut self, at: DateTime<Utc>, event: &LedgerEvent) {
        let Some(journal) = self.journal.as_mut() else {
            return;
        };
        let payload = match serde_json::to_value(event) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "failed to encode alarm journal entry");
                return;
            }
        };
        if let Err(err) = journal.append(JournalEntry::new(at, payload)) {
            warn!(path = %journal.path().display(), error = %err, "failed to append alarm journal entry");
        }
    }

    /// Drop the oldest inactive alarms until the limit is met; active ones always stay.
    fn trim(&mut self, limit: usize) {
        while self.history.len() > limit {
            match self.history.iter().rposition(|alarm| !alarm.is_active) {
                Some(index) => {
                    self.history.remove(index);
                }
                None => break,
            }
        }
    }

    fn apply_acknowledge(&mut self, id: AlarmId) -> bool {
        match self.latest_mut(id) {
            Some(alarm) => {
                alarm.is_ackn = true;
                true
            }
            None => false,
        }
    }

    /// Returns whether the alarm went from active to inactive.
    fn apply_clear(&mut self, id: AlarmId, force: bool) -> Option<bool> {
        let alarm = self.latest_mut(id)?;
        if !(force || alarm.is_ackn) {
            return None;
        }
        let was_active = alarm.is_active;
        alarm.is_active = false;
        alarm.is_audible = false;
        alarm.silence.cancel();
        Some(was_active)
    }
}

/// Bounded, most-recent-first alarm history shared by every policy.
///
/// Operations never fail towards the caller: unknown ids are silent no-ops
/// and storage problems are logged.
#[derive(Debug)]
pub struct AlarmLedger {
    settings: LedgerSettings,
    store: Option<HistoryStore>,
    /// Journal replayed by [`AlarmLedger::load`] without opening it for writing.
    replay_from: Option<PathBuf>,
    inner: Mutex<LedgerInner>,
}

impl AlarmLedger {
    /// In-memory ledger without storage.
    pub fn new(settings: LedgerSettings) -> Self {
        Self {
            settings,
            store: None,
            replay_from: None,
            inner: Mutex::new(LedgerInner::default()),
        }
    }

    /// Ledger bound to the history file and, if configured, the journal.
    pub fn from_config(config: &AlarmsConfig) -> Result<Self, PersistenceError> {
        let mut ledger = Self::new(LedgerSettings::from(config))
            .with_store(HistoryStore::new(config.file.clone()));
        if let Some(path) = &config.journal {
            ledger = ledger.with_journal(JournalWriter::open(path)?);
        }
        Ok(ledger)
    }

    /// Ledger for inspecting stored alarms. Loading reads the history file and
    /// replays an existing journal; nothing is created or appended.
    pub fn read_only(config: &AlarmsConfig) -> Self {
        let mut ledger = Self::new(LedgerSettings::from(config))
            .with_store(HistoryStore::new(config.file.clone()));
        ledger.replay_from = config.journal.clone();
        ledger
    }

    pub fn with_store(mut self, store: HistoryStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_journal(self, journal: JournalWriter) -> Self {
        self.inner.lock().journal = Some(journal);
        self
    }

    pub fn settings(&self) -> &LedgerSettings {
        &self.settings
    }

    /// Record a new alarm unless the same id is still outstanding or was
    /// raised within the cooldown window. Returns whether it was recorded.
    pub fn raise(
        &self,
        id: AlarmId,
        level: AlarmLevel,
        failure: impl Into<String>,
        action: impl Into<String>,
        at: DateTime<Utc>,
    ) -> bool {
        let mut inner = self.inner.lock();
        if inner
            .history
            .iter()
            .any(|alarm| alarm.id == id && alarm.is_outstanding())
        {
            debug!(alarm_id = %id, "alarm already outstanding");
            return false;
        }
        if inner
            .history
            .iter()
            .any(|alarm| alarm.id == id && elapsed(alarm.time, at) <= self.settings.cooldown)
        {
            debug!(alarm_id = %id, "alarm inside re-raise cooldown");
            return false;
        }

        let alarm = Alarm::new(id, level, failure, action, at);
        log_raise(&alarm);
        inner.record(
            at,
            &LedgerEvent::Raise {
                alarm: alarm.clone(),
            },
        );
        inner.history.insert(0, alarm);
        inner.trim(self.settings.history);
        true
    }

    pub fn acknowledge(&self, id: AlarmId, at: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        if inner.apply_acknowledge(id) {
            info!(target: ALARM_TARGET, alarm_id = %id, "alarm acknowledged");
            inner.record(at, &LedgerEvent::Acknowledge { id });
        }
    }

    /// Deactivate the latest alarm with `id` if acknowledged, or unconditionally with `force`.
    pub fn clear(&self, id: AlarmId, force: bool, at: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        let Some(was_active) = inner.apply_clear(id, force) else {
            return;
        };
        if was_active {
            warn!(target: ALARM_TARGET, alarm_id = %id, force, "alarm cleared");
            inner.record(at, &LedgerEvent::Clear { id, force });
        }
        inner.trim(self.settings.history);
    }

    /// Mute the latest alarm with `id` for the configured silence duration.
    pub fn silence(&self, id: AlarmId, now: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        let Some(alarm) = inner.latest_mut(id) else {
            return;
        };
        alarm.is_audible = false;
        alarm.silence.arm(now, self.settings.silence);
        info!(target: ALARM_TARGET, alarm_id = %id, silence_s = self.settings.silence.as_secs(), "alarm silenced");
        inner.record(now, &LedgerEvent::Silence { id });
    }

    /// Restore audibility of expired silences; inactive alarms stay mute.
    pub fn poll(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        for alarm in inner.history.iter_mut() {
            if alarm.silence.fire_if_due(now) && alarm.is_active {
                alarm.is_audible = alarm.level.is_audible();
                debug!(alarm_id = %alarm.id, "alarm silence expired");
            }
        }
    }

    pub fn is_any_audible(&self) -> bool {
        self.inner.lock().history.iter().any(|alarm| alarm.is_audible)
    }

    pub fn is_any_active(&self) -> bool {
        self.inner.lock().history.iter().any(|alarm| alarm.is_active)
    }

    pub fn recent_alarm(&self) -> Option<Alarm> {
        self.inner.lock().history.first().cloned()
    }

    pub fn find(&self, id: AlarmId) -> Option<Alarm> {
        self.inner
            .lock()
            .history
            .iter()
            .find(|alarm| alarm.id == id)
            .cloned()
    }

    /// Snapshot of the history, most recent first.
    pub fn entries(&self) -> Vec<Alarm> {
        self.inner.lock().history.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().history.is_empty()
    }

    /// Render the history as one line per alarm: `HH:MM<sep>level<sep>failure<sep>action`.
    ///
    /// Inactive alarms show their level in parentheses; the action of alarms
    /// below the configured action level is left blank.
    pub fn persist_plain(&self, separator: &str) -> String {
        format_plain(&self.inner.lock().history, separator, self.settings.action_level)
    }

    /// Replace the history, e.g. with records read from disk.
    pub fn restore(&self, mut records: Vec<Alarm>) {
        records.sort_by(|a, b| b.time.cmp(&a.time));
        let mut inner = self.inner.lock();
        inner.history = records;
        inner.trim(self.settings.history);
    }

    /// Load the stored history and replay the journal written since the last
    /// shutdown. Missing or unreadable storage yields an empty history.
    pub fn load(&self) -> usize {
        if let Some(store) = &self.store {
            match store.load::<Alarm>() {
                Ok(Some(records)) => {
                    info!(path = %store.path().display(), records = records.len(), "alarm history restored");
                    self.restore(records);
                }
                Ok(None) => {
                    info!(path = %store.path().display(), "no alarm history found; starting empty");
                }
                Err(err) => {
                    warn!(path = %store.path().display(), error = %err, "alarm history unreadable; starting empty");
                }
            }
        }

        let journal_path = self
            .inner
            .lock()
            .journal
            .as_ref()
            .map(|journal| journal.path().to_path_buf())
            .or_else(|| self.replay_from.clone().filter(|path| path.exists()));
        if let Some(path) = journal_path {
            match self.replay(&path) {
                Ok(0) => {}
                Ok(applied) => info!(path = %path.display(), applied, "alarm journal replayed"),
                Err(err) => warn!(path = %path.display(), error = %err, "alarm journal unreadable"),
            }
        }
        self.len()
    }

    fn replay(&self, path: &Path) -> Result<usize, PersistenceError> {
        let mut inner = self.inner.lock();
        let mut applied = 0usize;
        replay_journal(path, |entry| {
            let event: LedgerEvent = match serde_json::from_value(entry.payload) {
                Ok(event) => event,
                Err(err) => {
                    warn!(sequence = entry.sequence, error = %err, "skipping undecodable journal entry");
                    return Ok(());
                }
            };
            match event {
                LedgerEvent::Raise { alarm } => {
                    if !inner
                        .history
                        .iter()
                        .any(|known| known.same_occurrence(&alarm))
                    {
                        let position = inner
                            .history
                            .iter()
                            .position(|known| known.time <= alarm.time)
                            .unwrap_or(inner.history.len());
                        inner.history.insert(position, alarm);
                        applied += 1;
                    }
                }
                LedgerEvent::Acknowledge { id } => {
                    inner.apply_acknowledge(id);
                    applied += 1;
                }
                LedgerEvent::Clear { id, force } => {
                    inner.apply_clear(id, force);
                    applied += 1;
                }
                LedgerEvent::Silence { .. } => {}
            }
            Ok(())
        })?;
        inner.trim(self.settings.history);
        Ok(applied)
    }

    /// Write the history to its store and rotate the journal.
    pub fn persist(&self) -> Result<(), PersistenceError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let mut inner = self.inner.lock();
        store.save(&inner.history)?;
        if let Some(journal) = inner.journal.as_mut() {
            journal.reset()?;
        }
        info!(path = %store.path().display(), records = inner.history.len(), "alarm history persisted");
        Ok(())
    }
}

fn log_raise(alarm: &Alarm) {
    match alarm.level {
        AlarmLevel::High => error!(
            target: ALARM_TARGET,
            alarm_id = %alarm.id,
            level = %alarm.level,
            failure = %alarm.failure,
            action = %alarm.action,
            "ALARM"
        ),
        AlarmLevel::Medium => warn!(
            target: ALARM_TARGET,
            alarm_id = %alarm.id,
            level = %alarm.level,
            failure = %alarm.failure,
            action = %alarm.action,
            "ALARM"
        ),
        AlarmLevel::Low => info!(
            target: ALARM_TARGET,
            alarm_id = %alarm.id,
            level = %alarm.level,
            failure = %alarm.failure,
            action = %alarm.action,
            "ALARM"
        ),
    }
}

fn format_plain(history: &[Alarm], separator: &str, action_level: AlarmLevel) -> String {
    if history.is_empty() {
        return "No alarms".to_owned();
    }
    history
        .iter()
        .map(|alarm| {
            let level = if alarm.is_active {
                alarm.level.to_string()
            } else {
                format!("({})", alarm.level)
            };
            let action = if alarm.level >= action_level {
                alarm.action.as_str()
            } else {
                ""
            };
            format!(
                "{}{sep}{}{sep}{}{sep}{}",
                alarm.time.format("%H:%M"),
                level,
                alarm.failure,
                action,
                sep = separator
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use r_bms_common::time::after;

    fn t0() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn ledger() -> AlarmLedger {
        AlarmLedger::new(LedgerSettings::default())
    }

    #[test]
    fn trim_keeps_active_alarms() {
        let mut inner = LedgerInner::default();
        for n in 0..4 {
            let mut alarm = Alarm::new(AlarmId::new(n), AlarmLevel::Low, "f", "a", t0());
            alarm.is_active = n % 2 == 0;
            inner.history.insert(0, alarm);
        }
        inner.trim(1);
        let ids: Vec<_> = inner.history.iter().map(|a| a.id.get()).collect();
        assert_eq!(ids, vec![2, 0]);
    }

    #[test]
    fn clear_of_inactive_alarm_is_not_logged_again() {
        let ledger = ledger();
        let id = AlarmId::new(7);
        assert!(ledger.raise(id, AlarmLevel::Medium, "f", "a", t0()));
        ledger.clear(id, true, t0());
        ledger.clear(id, true, t0());
        assert!(!ledger.is_any_active());
    }

    #[test]
    fn silence_restores_only_active_alarms() {
        let ledger = ledger();
        let kept = AlarmId::new(1);
        let resolved = AlarmId::new(2);
        ledger.raise(kept, AlarmLevel::High, "f", "a", t0());
        ledger.raise(resolved, AlarmLevel::High, "f", "a", t0());
        ledger.silence(kept, t0());
        ledger.silence(resolved, t0());
        assert!(!ledger.is_any_audible());

        // clear cancels the pending restore of `resolved`
        ledger.clear(resolved, true, t0());
        ledger.poll(after(t0(), Duration::from_secs(299)));
        assert!(!ledger.is_any_audible());
        ledger.poll(after(t0(), Duration::from_secs(300)));
        assert!(ledger.find(kept).unwrap().is_audible);
        assert!(!ledger.find(resolved).unwrap().is_audible);
    }

    #[test]
    fn repeated_silence_restarts_the_timer() {
        let ledger = ledger();
        let id = AlarmId::new(3);
        ledger.raise(id, AlarmLevel::Medium, "f", "a", t0());
        ledger.silence(id, t0());
        ledger.silence(id, after(t0(), Duration::from_secs(200)));
        ledger.poll(after(t0(), Duration::from_secs(300)));
        assert!(!ledger.is_any_audible());
        ledger.poll(after(t0(), Duration::from_secs(500)));
        assert!(ledger.is_any_audible());
    }

    #[test]
    fn unknown_ids_are_ignored() {
        let ledger = ledger();
        ledger.acknowledge(AlarmId::new(42), t0());
        ledger.clear(AlarmId::new(42), true, t0());
        ledger.silence(AlarmId::new(42), t0());
        assert!(ledger.is_empty());
    }
}
