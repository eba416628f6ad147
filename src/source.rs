use std::process::Command;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sysinfo::Networks;
use thiserror::Error;
use tracing::{debug, warn};

use crate::history::SpeedTestRecord;
use crate::metrics::CounterSnapshot;
use crate::units::bytes_to_megabits;

pub const DEFAULT_ENDPOINTS: [&str; 3] = [
    "1.1.1.1", // Cloudflare DNS
    "8.8.8.8", // Google DNS
    "4.2.2.2", // Level 3 DNS
];

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("no network interfaces found")]
    NoInterfaces,
    #[error("interface {0} not found")]
    UnknownInterface(String),
    #[error("failed to run {tool}: {source}")]
    Spawn { tool: &'static str, source: std::io::Error },
    #[error("{tool} failed: {message}")]
    ToolFailed { tool: &'static str, message: String },
    #[error("unreadable {what}: {message}")]
    Parse { what: &'static str, message: String },
}

/// Cumulative byte counters of the monitored interface.
pub trait CounterSource: Send {
    fn snapshot(&mut self) -> Result<CounterSnapshot, SourceError>;
}

/// One-shot latency probe against a fixed set of endpoints.
pub trait LatencyProbe: Send {
    fn probe(&self, endpoints: &[String]) -> Vec<PingStatus>;
}

/// One-shot bandwidth test. May take tens of seconds.
pub trait BandwidthTest: Send {
    fn run(&self) -> Result<SpeedTestRecord, SourceError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ProbeStatus {
    Success,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PingStatus {
    pub address: String,
    pub status: ProbeStatus,
    pub latency_ms: Option<f64>,
}

impl PingStatus {
    pub fn failed(address: &str, reason: impl Into<String>) -> Self {
        Self { address: address.to_string(), status: ProbeStatus::Failed(reason.into()), latency_ms: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceCounters {
    pub name: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Cumulative counters of every interface the OS reports.
pub fn interface_counters(networks: &Networks) -> Vec<InterfaceCounters> {
    let mut out: Vec<InterfaceCounters> = networks
        .iter()
        .map(|(name, data)| InterfaceCounters {
            name: name.clone(),
            rx_bytes: data.total_received(),
            tx_bytes: data.total_transmitted(),
        })
        .collect();
    out.sort_by(|a, b| a.name.cmp(&b.name));
    out
}

// Pure decision function for easier testing
pub(crate) fn pick_interface(
    explicit: Option<&str>,
    available: &[InterfaceCounters],
) -> Result<InterfaceCounters, SourceError> {
    if let Some(name) = explicit {
        return available
            .iter()
            .find(|i| i.name == name)
            .cloned()
            .ok_or_else(|| SourceError::UnknownInterface(name.to_string()));
    }
    available
        .iter()
        .filter(|i| !is_loopback(&i.name))
        .max_by_key(|i| i.rx_bytes.saturating_add(i.tx_bytes))
        .or_else(|| available.first())
        .cloned()
        .ok_or(SourceError::NoInterfaces)
}

fn is_loopback(name: &str) -> bool {
    name == "lo" || name.starts_with("lo0") || name.to_ascii_lowercase().contains("loopback")
}

pub fn list_interfaces() -> Vec<InterfaceCounters> {
    interface_counters(&Networks::new_with_refreshed_list())
}

/// Counter source over the OS interface table.
///
/// The interface is resolved once at construction; later snapshots follow
/// that name even if another interface becomes busier.
pub struct SystemCounters {
    networks: Networks,
    interface: String,
}

impl SystemCounters {
    pub fn open(explicit: Option<&str>) -> Result<Self, SourceError> {
        let networks = Networks::new_with_refreshed_list();
        let chosen = pick_interface(explicit, &interface_counters(&networks))?;
        Ok(Self { networks, interface: chosen.name })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }
}

impl CounterSource for SystemCounters {
    fn snapshot(&mut self) -> Result<CounterSnapshot, SourceError> {
        self.networks.refresh(true);
        let data = self
            .networks
            .get(&self.interface)
            .ok_or_else(|| SourceError::UnknownInterface(self.interface.clone()))?;
        Ok(CounterSnapshot::now(data.total_received(), data.total_transmitted()))
    }
}

/// Latency probe that shells out to the system `ping`, one process per
/// endpoint, all endpoints in parallel.
pub struct SystemPing {
    pub timeout: Duration,
}

impl Default for SystemPing {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(2) }
    }
}

impl SystemPing {
    fn probe_one(&self, address: &str) -> PingStatus {
        let output = Command::new("ping")
            .args(["-c", "1", "-W"])
            .arg(self.timeout.as_secs().max(1).to_string())
            .arg(address)
            .output();
        match output {
            Ok(out) if out.status.success() => {
                match parse_ping_latency(&String::from_utf8_lossy(&out.stdout)) {
                    Some(ms) => PingStatus {
                        address: address.to_string(),
                        status: ProbeStatus::Success,
                        latency_ms: Some(ms),
                    },
                    None => PingStatus::failed(address, "no round-trip time in ping output"),
                }
            }
            Ok(out) => PingStatus::failed(address, format!("ping exited with {}", out.status)),
            Err(e) => {
                warn!(?e, address, "Failed to spawn ping");
                PingStatus::failed(address, e.to_string())
            }
        }
    }
}

impl LatencyProbe for SystemPing {
    fn probe(&self, endpoints: &[String]) -> Vec<PingStatus> {
        std::thread::scope(|scope| {
            let handles: Vec<_> = endpoints
                .iter()
                .map(|addr| (addr, scope.spawn(move || self.probe_one(addr))))
                .collect();
            handles
                .into_iter()
                .map(|(addr, h)| h.join().unwrap_or_else(|_| PingStatus::failed(addr, "probe thread panicked")))
                .collect()
        })
    }
}

/// Extracts `time=12.3 ms` (or `time<1 ms`) from ping output.
pub(crate) fn parse_ping_latency(output: &str) -> Option<f64> {
    let idx = output.find("time=").map(|i| i + 5).or_else(|| output.find("time<").map(|i| i + 5))?;
    let rest = &output[idx..];
    let end = rest.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(rest.len());
    rest[..end].parse().ok()
}

/// Bandwidth test driven by the Ookla `speedtest` CLI in JSON mode.
pub struct SpeedtestCli {
    pub program: String,
}

impl Default for SpeedtestCli {
    fn default() -> Self {
        Self { program: "speedtest".to_string() }
    }
}

impl BandwidthTest for SpeedtestCli {
    fn run(&self) -> Result<SpeedTestRecord, SourceError> {
        debug!(program = %self.program, "Running speed test");
        let output = Command::new(&self.program)
            .arg("--format=json")
            .output()
            .map_err(|source| SourceError::Spawn { tool: "speedtest", source })?;
        if !output.status.success() {
            return Err(SourceError::ToolFailed {
                tool: "speedtest",
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        parse_speedtest_json(&String::from_utf8_lossy(&output.stdout), Utc::now().timestamp_millis())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpeedtestReport {
    ping: SpeedtestPing,
    download: SpeedtestTransfer,
    upload: SpeedtestTransfer,
    #[serde(default)]
    packet_loss: Option<f64>,
}

#[derive(Deserialize)]
struct SpeedtestPing {
    latency: f64,
    #[serde(default)]
    jitter: f64,
}

#[derive(Deserialize)]
struct SpeedtestTransfer {
    /// bytes per second
    bandwidth: f64,
}

/// Converts a `speedtest --format=json` report into a history record.
pub fn parse_speedtest_json(json: &str, timestamp: i64) -> Result<SpeedTestRecord, SourceError> {
    let report: SpeedtestReport = serde_json::from_str(json)
        .map_err(|e| SourceError::Parse { what: "speedtest report", message: e.to_string() })?;
    Ok(SpeedTestRecord {
        download_mbps: bytes_to_megabits(report.download.bandwidth),
        upload_mbps: bytes_to_megabits(report.upload.bandwidth),
        latency_ms: report.ping.latency,
        jitter_ms: report.ping.jitter,
        packet_loss_percent: report.packet_loss.unwrap_or(0.0),
        timestamp,
    })
}
