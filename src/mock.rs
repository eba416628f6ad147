use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::Utc;

use crate::history::SpeedTestRecord;
use crate::metrics::CounterSnapshot;
use crate::source::{BandwidthTest, CounterSource, LatencyProbe, PingStatus, ProbeStatus, SourceError};

/// Synthetic interface: counters grow by a wobbling amount each read and drop
/// back to zero every `reset_every` reads (0 never resets).
pub struct MockCounters {
    rx: u64,
    tx: u64,
    reads: u64,
    pub reset_every: u64,
}

impl MockCounters {
    pub fn new(reset_every: u64) -> Self {
        Self { rx: 0, tx: 0, reads: 0, reset_every }
    }
}

impl CounterSource for MockCounters {
    fn snapshot(&mut self) -> Result<CounterSnapshot, SourceError> {
        self.reads += 1;
        if self.reset_every > 0 && self.reads % self.reset_every == 0 {
            self.rx = 0;
            self.tx = 0;
        } else {
            // 2..6 Mbit/s down, a quarter of that up
            let wobble = (self.reads % 5) * 125_000;
            self.rx += 250_000 + wobble;
            self.tx += (250_000 + wobble) / 4;
        }
        Ok(CounterSnapshot::now(self.rx, self.tx))
    }
}

/// Replays a fixed script of readings; `None` entries fail the read.
#[cfg(test)]
pub struct ScriptedCounters {
    script: std::collections::VecDeque<Option<(u64, u64)>>,
}

#[cfg(test)]
impl ScriptedCounters {
    pub fn new(script: impl IntoIterator<Item = Option<(u64, u64)>>) -> Self {
        Self { script: script.into_iter().collect() }
    }
}

#[cfg(test)]
impl CounterSource for ScriptedCounters {
    fn snapshot(&mut self) -> Result<CounterSnapshot, SourceError> {
        match self.script.pop_front() {
            Some(Some((rx, tx))) => Ok(CounterSnapshot::now(rx, tx)),
            Some(None) => Err(SourceError::ToolFailed { tool: "mock", message: "scripted failure".into() }),
            None => Err(SourceError::NoInterfaces),
        }
    }
}

/// Answers every endpoint with a latency derived from its position.
pub struct MockProbe;

impl LatencyProbe for MockProbe {
    fn probe(&self, endpoints: &[String]) -> Vec<PingStatus> {
        endpoints
            .iter()
            .enumerate()
            .map(|(i, addr)| PingStatus {
                address: addr.clone(),
                status: ProbeStatus::Success,
                latency_ms: Some(12.0 + 20.0 * i as f64),
            })
            .collect()
    }
}

/// Instant bandwidth test with plausible numbers and strictly increasing
/// timestamps.
pub struct MockBandwidthTest {
    pub delay: Duration,
    last_timestamp: AtomicI64,
}

impl MockBandwidthTest {
    pub fn new(delay: Duration) -> Self {
        Self { delay, last_timestamp: AtomicI64::new(0) }
    }
}

impl BandwidthTest for MockBandwidthTest {
    fn run(&self) -> Result<SpeedTestRecord, SourceError> {
        std::thread::sleep(self.delay);
        let now = Utc::now().timestamp_millis();
        let prev = self.last_timestamp.fetch_max(now, Ordering::Relaxed);
        let timestamp = if now <= prev {
            self.last_timestamp.fetch_add(1, Ordering::Relaxed) + 1
        } else {
            now
        };
        Ok(SpeedTestRecord {
            download_mbps: 480.0 + (timestamp % 200) as f64,
            upload_mbps: 8.0 + (timestamp % 7) as f64,
            latency_ms: 15.0 + (timestamp % 60) as f64,
            jitter_ms: 2.0 + (timestamp % 15) as f64,
            packet_loss_percent: 0.0,
            timestamp,
        })
    }
}
