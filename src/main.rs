mod aggregate;
mod classify;
mod cli;
mod config;
mod history;
mod metrics;
mod mock;
mod monitor;
mod source;
mod state;
mod units;
mod window;
mod ui {
    pub mod history;
    pub mod overview;
}

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{CommandFactory, Parser};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands, OutputFormat};
use crate::config::ConfigError;
use crate::history::{HistoryError, HistoryStore};
use crate::mock::MockBandwidthTest;
use crate::monitor::run_monitor;
use crate::source::{list_interfaces, parse_speedtest_json, BandwidthTest, SourceError, SpeedtestCli};
use crate::ui::history::{record_cells, HEADERS};
use crate::window::WindowError;

fn print_interfaces(format: OutputFormat) -> Result<()> {
    let interfaces = list_interfaces();
    if interfaces.is_empty() {
        return Err(SourceError::NoInterfaces.into());
    }
    match format {
        OutputFormat::Text => {
            for i in interfaces {
                println!("{}\trx {} B\ttx {} B", i.name, i.rx_bytes, i.tx_bytes);
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&interfaces)?),
    }
    Ok(())
}

fn open_store(path: &Path) -> Result<HistoryStore> {
    HistoryStore::open(path).with_context(|| format!("Opening history at {}", path.display()))
}

fn print_history(db: &Path, format: OutputFormat, clear: bool) -> Result<()> {
    let store = open_store(db)?;
    if clear {
        let removed = store.clear().context("Clearing history")?;
        println!("removed {removed} record(s)");
        return Ok(());
    }
    let records = store.list_all().context("Listing history")?;
    match format {
        OutputFormat::Text => {
            if records.is_empty() {
                eprintln!("<no speed tests recorded>");
                return Ok(());
            }
            println!("{}", HEADERS.join("\t"));
            for r in &records {
                let cells: Vec<String> = record_cells(r).into_iter().map(|(text, _)| text).collect();
                println!("{}", cells.join("\t"));
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&records)?),
    }
    Ok(())
}

fn record_speed_test(db: &Path, from_json: Option<&Path>, mock: bool) -> Result<()> {
    let store = open_store(db)?;
    let record = match from_json {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Reading speedtest report {}", path.display()))?;
            parse_speedtest_json(&text, Utc::now().timestamp_millis())?
        }
        None if mock => MockBandwidthTest::new(Duration::ZERO).run()?,
        None => SpeedtestCli::default().run().context("Running speed test")?,
    };
    store.append(&record).context("Saving speed test")?;
    info!(timestamp = record.timestamp, stored = store.len()?, "Recorded speed test");
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .try_init()
        .ok();

    let cli = Cli::parse();
    let result: Result<()> = match cli.command {
        Some(Commands::Interfaces { format }) => print_interfaces(format),
        Some(Commands::Monitor(monitor)) => run_monitor(monitor),
        Some(Commands::History { db, format, clear }) => print_history(&db.db, format, clear),
        Some(Commands::Record { db, from_json, mock }) => record_speed_test(&db.db, from_json.as_deref(), mock),
        None => {
            Cli::command().print_help().ok();
            println!();
            Ok(())
        }
    };

    if let Err(err) = result {
        // Map to stable exit codes
        let code = exit_code_for_error(&err);
        eprintln!("error: {err:?}");
        std::process::exit(code);
    }
}

pub(crate) fn exit_code_for_error(err: &anyhow::Error) -> i32 {
    // 2: no usable interface, 3: history storage, 4: measurement tool, 5: bad settings, 1: other
    for cause in err.chain() {
        if let Some(src) = cause.downcast_ref::<SourceError>() {
            return match src {
                SourceError::NoInterfaces | SourceError::UnknownInterface(_) => 2,
                _ => 4,
            };
        }
        if cause.is::<HistoryError>() {
            return 3;
        }
        if cause.is::<ConfigError>() || cause.is::<WindowError>() {
            return 5;
        }
    }
    1
}
