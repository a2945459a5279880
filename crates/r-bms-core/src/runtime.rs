//! ---
//! bms_section: "01-core-functionality"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Telemetry fan-out, supervisor and control loop."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use r_bms_alarms::AlarmLedger;
use r_bms_common::config::TelemetryConfig;
use r_bms_common::time::after;
use r_bms_rt::RateLimiter;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::supervisor::BmsSupervisor;
use crate::telemetry::TelemetryFrame;

const TELEMETRY_QUEUE: usize = 64;

/// Virtual clock anchored at the latest telemetry timestamp.
///
/// Between frames time advances with the monotonic clock, so timers keep
/// firing when telemetry stalls. A frame that arrives later than its
/// timestamp spacing moves the clock to the later of the two; the clock never
/// runs backwards.
#[derive(Debug, Default)]
struct TelemetryClock {
    anchor: Option<(DateTime<Utc>, Instant)>,
    last_frame: Option<DateTime<Utc>>,
}

impl TelemetryClock {
    fn now(&self) -> DateTime<Utc> {
        match self.anchor {
            Some((at, seen)) => after(at, seen.elapsed()),
            None => Utc::now(),
        }
    }

    /// Accept a frame and return the time to evaluate it at, or `None` when
    /// it is older than the previously accepted frame.
    fn observe(&mut self, timestamp: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.last_frame.is_some_and(|last| timestamp < last) {
            return None;
        }
        let at = match self.anchor {
            Some(_) => timestamp.max(self.now()),
            None => timestamp,
        };
        self.last_frame = Some(timestamp);
        self.anchor = Some((at, Instant::now()));
        Some(at)
    }
}

/// Async control loop around a [`BmsSupervisor`].
#[derive(Debug)]
pub struct BmsRuntime {
    supervisor: BmsSupervisor,
    poll_interval: Duration,
}

impl BmsRuntime {
    pub fn new(supervisor: BmsSupervisor, telemetry: &TelemetryConfig) -> Self {
        Self {
            supervisor,
            poll_interval: telemetry.poll_interval_ms,
        }
    }

    /// Spawn the control task and return a handle for feeding and stopping it.
    pub fn start(self) -> RuntimeHandle {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(4);
        let (telemetry_tx, telemetry_rx) = mpsc::channel(TELEMETRY_QUEUE);
        let ledger = self.supervisor.ledger().clone();
        let task = tokio::spawn(control_loop(
            self.supervisor,
            self.poll_interval,
            telemetry_rx,
            shutdown_rx,
        ));
        info!(poll_ms = self.poll_interval.as_millis() as u64, "control loop started");
        RuntimeHandle {
            shutdown: shutdown_tx,
            telemetry: telemetry_tx,
            ledger,
            task,
        }
    }
}

/// Handle returned by [`BmsRuntime::start`].
#[derive(Debug)]
pub struct RuntimeHandle {
    shutdown: broadcast::Sender<()>,
    telemetry: mpsc::Sender<TelemetryFrame>,
    ledger: Arc<AlarmLedger>,
    task: JoinHandle<BmsSupervisor>,
}

impl RuntimeHandle {
    pub fn sender(&self) -> mpsc::Sender<TelemetryFrame> {
        self.telemetry.clone()
    }

    pub fn ledger(&self) -> &Arc<AlarmLedger> {
        &self.ledger
    }

    /// Stop the loop after draining queued telemetry and persist alarm history.
    pub async fn shutdown(self) -> Result<BmsSupervisor> {
        let _ = self.shutdown.send(());
        let supervisor = self.task.await.context("control loop task failed")?;
        self.ledger
            .persist()
            .context("failed to persist alarm history")?;
        info!(alarms = self.ledger.len(), "control loop stopped; alarm history persisted");
        Ok(supervisor)
    }
}

async fn control_loop(
    mut supervisor: BmsSupervisor,
    poll_interval: Duration,
    mut telemetry: mpsc::Receiver<TelemetryFrame>,
    mut shutdown: broadcast::Receiver<()>,
) -> BmsSupervisor {
    let mut limiter = RateLimiter::new(poll_interval);
    let mut clock = TelemetryClock::default();
    let mut telemetry_open = true;

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                debug!("control loop shutdown signal received");
                while let Ok(frame) = telemetry.try_recv() {
                    process(&mut supervisor, &mut clock, frame);
                }
                break;
            }
            frame = telemetry.recv(), if telemetry_open => match frame {
                Some(frame) => process(&mut supervisor, &mut clock, frame),
                None => {
                    debug!("telemetry channel closed; timers keep running");
                    telemetry_open = false;
                }
            },
            _ = limiter.tick() => supervisor.poll(clock.now()),
        }
    }
    supervisor
}

fn process(supervisor: &mut BmsSupervisor, clock: &mut TelemetryClock, frame: TelemetryFrame) {
    match clock.observe(frame.timestamp) {
        Some(at) => supervisor.ingest_at(&frame, at),
        None => warn!(timestamp = %frame.timestamp, "out-of-order telemetry frame dropped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn clock_advances_between_frames() {
        let mut clock = TelemetryClock::default();
        let t0 = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        assert_eq!(clock.observe(t0), Some(t0));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(clock.now(), after(t0, Duration::from_secs(5)));
        assert_eq!(
            clock.observe(after(t0, Duration::from_secs(6))),
            Some(after(t0, Duration::from_secs(6)))
        );
        assert!(clock.observe(after(t0, Duration::from_secs(1))).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn late_frames_are_accepted_without_rewinding() {
        let mut clock = TelemetryClock::default();
        let t0 = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        clock.observe(t0);
        tokio::time::advance(Duration::from_millis(2_050)).await;

        let late = after(t0, Duration::from_secs(2));
        let at = clock.observe(late).expect("in-order frame accepted");
        assert_eq!(at, after(t0, Duration::from_millis(2_050)));
        assert!(clock.now() >= at);

        // same timestamp again is still in order
        assert!(clock.observe(late).is_some());
    }
}
