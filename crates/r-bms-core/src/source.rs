//! ---
//! bms_section: "01-core-functionality"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Telemetry fan-out, supervisor and control loop."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use r_bms_rt::RateLimiter;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::telemetry::TelemetryFrame;

/// Producer of telemetry frames in arrival order.
#[async_trait]
pub trait TelemetrySource: Send {
    /// Next frame, or `None` once the source is exhausted.
    async fn next_frame(&mut self) -> Result<Option<TelemetryFrame>>;
}

/// Replays JSON-lines telemetry, one [`TelemetryFrame`] object per line.
pub struct JsonlReplaySource {
    lines: Lines<BufReader<Box<dyn AsyncRead + Unpin + Send>>>,
    line_no: usize,
}

impl std::fmt::Debug for JsonlReplaySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonlReplaySource")
            .field("line_no", &self.line_no)
            .finish_non_exhaustive()
    }
}

impl JsonlReplaySource {
    /// Open a replay file; `-` reads standard input.
    pub async fn open(path: &Path) -> Result<Self> {
        if path.as_os_str() == "-" {
            return Ok(Self::from_reader(tokio::io::stdin()));
        }
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("unable to open telemetry replay {}", path.display()))?;
        Ok(Self::from_reader(file))
    }

    pub fn from_reader(reader: impl AsyncRead + Unpin + Send + 'static) -> Self {
        let boxed: Box<dyn AsyncRead + Unpin + Send> = Box::new(reader);
        Self {
            lines: BufReader::new(boxed).lines(),
            line_no: 0,
        }
    }
}

#[async_trait]
impl TelemetrySource for JsonlReplaySource {
    async fn next_frame(&mut self) -> Result<Option<TelemetryFrame>> {
        while let Some(line) = self.lines.next_line().await? {
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(frame) => return Ok(Some(frame)),
                Err(err) => {
                    warn!(line = self.line_no, error = %err, "skipping malformed telemetry line");
                }
            }
        }
        Ok(None)
    }
}

/// Forward frames from `source` into the control loop, one per `interval`.
///
/// Returns the number of frames delivered; stops early if the loop is gone.
pub async fn pump<S: TelemetrySource>(
    mut source: S,
    sender: mpsc::Sender<TelemetryFrame>,
    interval: Duration,
) -> Result<usize> {
    let mut limiter = RateLimiter::new(interval);
    let mut delivered = 0usize;
    while let Some(frame) = source.next_frame().await? {
        limiter.tick().await;
        if sender.send(frame).await.is_err() {
            warn!(delivered, "control loop stopped before telemetry was exhausted");
            break;
        }
        delivered += 1;
    }
    info!(delivered, "telemetry source exhausted");
    Ok(delivered)
}
