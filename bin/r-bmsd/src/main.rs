//! ---
//! bms_section: "01-core-functionality"
//! bms_subsection: "binary"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Binary entrypoint for the R-BMS daemon."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use r_bms_alarms::AlarmLedger;
use r_bms_common::config::AppConfig;
use r_bms_common::logging::{init_tracing, LogFormat};
use r_bms_core::{pump, BmsRuntime, BmsSupervisor, JsonlReplaySource};
use r_bms_protection::{RelayState, SimulatedRelay};
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "R-BMS battery protection daemon", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, help = "Override the stdout log format")]
    format: Option<CliFormat>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliFormat {
    Json,
    Pretty,
}

impl From<CliFormat> for LogFormat {
    fn from(value: CliFormat) -> Self {
        match value {
            CliFormat::Json => LogFormat::StructuredJson,
            CliFormat::Pretty => LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the protection supervisor against a simulated relay")]
    Run {
        #[arg(long, value_name = "FILE", help = "JSON-lines telemetry to replay ('-' for stdin)")]
        replay: Option<PathBuf>,
    },
    #[command(about = "Print the persisted alarm history")]
    Alarms {
        #[arg(long, default_value = "\t", help = "Column separator")]
        separator: String,
    },
    #[command(about = "Validate the configuration and exit")]
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/r-bms.toml"));
    candidates.push(PathBuf::from("configs/r-bms.example.toml"));

    let loaded = AppConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;
    if let Some(format) = cli.format {
        config.logging.format = format.into();
    }

    match cli.command.unwrap_or(Commands::Run { replay: None }) {
        Commands::CheckConfig => {
            println!("configuration OK: {}", loaded.source.display());
        }
        Commands::Alarms { separator } => {
            let ledger = AlarmLedger::read_only(&config.alarms);
            ledger.load();
            println!("{}", ledger.persist_plain(&separator));
        }
        Commands::Run { replay } => {
            init_tracing("r-bmsd", &config.logging)?;
            info!(config_path = %loaded.source.display(), "configuration loaded");
            run_daemon(config, replay).await?;
        }
    }
    Ok(())
}

async fn run_daemon(config: AppConfig, replay: Option<PathBuf>) -> Result<()> {
    let ledger = Arc::new(
        AlarmLedger::from_config(&config.alarms).context("failed to open alarm storage")?,
    );
    let restored = ledger.load();
    info!(restored, "alarm history restored");

    let relay = Arc::new(SimulatedRelay::new(RelayState::Off));
    let supervisor = BmsSupervisor::from_config(&config, ledger, relay)
        .context("failed to build protection policies")?;
    let handle = BmsRuntime::new(supervisor, &config.telemetry).start();

    let replay = replay.or_else(|| config.telemetry.replay.clone());
    let feeder = match replay {
        Some(path) => {
            let source = JsonlReplaySource::open(&path).await?;
            info!(replay = %path.display(), "replaying telemetry");
            Some(tokio::spawn(pump(
                source,
                handle.sender(),
                config.telemetry.interval_sec,
            )))
        }
        None => {
            warn!("no telemetry source configured; only timers are running");
            None
        }
    };

    info!("daemon running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");
    if let Some(feeder) = feeder {
        feeder.abort();
    }
    let supervisor = handle.shutdown().await?;
    if supervisor.ledger().is_any_active() {
        warn!("shutting down with active alarms");
    }
    Ok(())
}
