use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::source::DEFAULT_ENDPOINTS;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List network interfaces and their byte counters
    Interfaces {
        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Watch live throughput, ping latency and speed tests
    Monitor(Monitor),
    /// Show the persisted speed-test history, newest first
    History {
        #[command(flatten)]
        db: DbArgs,
        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
        /// Delete every stored record instead of listing
        #[arg(long)]
        clear: bool,
    },
    /// Run one speed test (or import a result) and store it
    Record {
        #[command(flatten)]
        db: DbArgs,
        /// Import a `speedtest --format=json` report instead of running a test
        #[arg(long)]
        from_json: Option<PathBuf>,
        /// Use a synthetic speed test
        #[arg(long)]
        mock: bool,
    },
}

#[derive(Args, Clone, Debug)]
pub struct DbArgs {
    /// Speed-test history database
    #[arg(long, default_value = "netpulse.db")]
    pub db: PathBuf,
}

#[derive(Parser, Clone, Debug)]
pub struct Monitor {
    /// Interface to watch (auto-select the busiest non-loopback one if omitted)
    #[arg(long)]
    pub interface: Option<String>,

    /// Counter sampling period in milliseconds
    #[arg(long, default_value_t = 1_000)]
    pub period_ms: u64,

    /// How much live throughput history to keep, in seconds
    #[arg(long, default_value_t = 300)]
    pub retention_secs: u64,

    /// Ping probe period in milliseconds
    #[arg(long, default_value_t = 3_000)]
    pub ping_period_ms: u64,

    /// Minutes between automatic speed tests (0 disables them)
    #[arg(long, default_value_t = 60.0)]
    pub speedtest_interval_mins: f64,

    /// Endpoint to ping; repeat for several
    #[arg(long = "endpoint", default_values_t = DEFAULT_ENDPOINTS.map(String::from))]
    pub endpoints: Vec<String>,

    #[command(flatten)]
    pub db: DbArgs,

    /// Use synthetic counters, pings and speed tests
    #[arg(long)]
    pub mock: bool,

    /// Log summaries instead of drawing the terminal UI
    #[arg(long)]
    pub headless: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}
