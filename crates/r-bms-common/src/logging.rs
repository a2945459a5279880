//! ---
//! bms_section: "01-core-functionality"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Tracing setup with a dedicated alarm trail."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use anyhow::Result;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::{EnvFilter, Targets};
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "R_BMS_LOG";

/// Target used by the alarm ledger for raise, acknowledge and clear events.
pub const ALARM_TARGET: &str = "r_bms::alarm";

static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
static STDOUT_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
static ALARM_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Available log formats for the daemon.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Install the global subscriber.
///
/// * `R_BMS_LOG` sets the filter for stdout and the daily service log, falling
///   back to `RUST_LOG` and then `info`.
/// * With `alarmTrail` enabled every event on [`ALARM_TARGET`] also goes to
///   `<prefix>-alarms.log`. That layer ignores the filter above, so alarms
///   stay on disk when the service log is turned down to `error` or `off`.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    std::fs::create_dir_all(&config.directory)?;
    let prefix = config
        .file_prefix
        .clone()
        .unwrap_or_else(|| service_name.to_owned());
    let directive = filter_directive();

    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    let _ = STDOUT_GUARD.set(stdout_guard);
    let stdout_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_writer(stdout_writer)
            .with_filter(EnvFilter::new(&directive))
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .with_filter(EnvFilter::new(&directive))
            .boxed(),
    };

    let (file_writer, file_guard) =
        tracing_appender::non_blocking(daily(&config.directory, format!("{prefix}.log")));
    let _ = FILE_GUARD.set(file_guard);
    let file_layer = fmt::layer()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .json()
        .with_writer(file_writer)
        .with_filter(EnvFilter::new(&directive))
        .boxed();

    let alarm_layer = if config.alarm_trail {
        let (alarm_writer, alarm_guard) = tracing_appender::non_blocking(daily(
            &config.directory,
            format!("{prefix}-alarms.log"),
        ));
        let _ = ALARM_GUARD.set(alarm_guard);
        Some(
            fmt::layer()
                .with_target(false)
                .with_timer(fmt::time::UtcTime::rfc_3339())
                .json()
                .flatten_event(true)
                .with_writer(alarm_writer)
                .with_filter(alarm_trail_filter())
                .boxed(),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .with(alarm_layer)
        .try_init()
        .ok();

    info!(
        service = %service_name,
        log_dir = %config.directory.display(),
        filter = %directive,
        alarm_trail = config.alarm_trail,
        "tracing initialised"
    );
    Ok(())
}

/// Filter directive for the service log; invalid overrides fall back to `info`.
fn filter_directive() -> String {
    for var in [LOG_ENV, EnvFilter::DEFAULT_ENV] {
        let Ok(directive) = std::env::var(var) else {
            continue;
        };
        match EnvFilter::try_new(&directive) {
            Ok(_) => return directive,
            Err(err) => eprintln!("invalid {var} directive ({err}); ignoring it"),
        }
    }
    "info".to_owned()
}

fn alarm_trail_filter() -> Targets {
    Targets::new().with_target(ALARM_TARGET, LevelFilter::INFO)
}
