use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::debug;

use crate::units::bytes_to_megabits;

/// Cumulative interface counters at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterSnapshot {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub captured_at: DateTime<Local>,
}

impl CounterSnapshot {
    pub fn now(rx_bytes: u64, tx_bytes: u64) -> Self {
        Self { rx_bytes, tx_bytes, captured_at: Local::now() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThroughputSample {
    pub time: String,
    pub rx_mbps: f64,
    pub tx_mbps: f64,
}

/// Rate between two snapshots taken one sampling period apart.
///
/// Returns `None` when either counter went backwards (interface restart or
/// counter wrap): such a delta is dropped, never clamped to zero.
pub fn rate_between(
    prev: &CounterSnapshot,
    curr: &CounterSnapshot,
    period: Duration,
) -> Option<ThroughputSample> {
    let (Some(rx_delta), Some(tx_delta)) = (
        curr.rx_bytes.checked_sub(prev.rx_bytes),
        curr.tx_bytes.checked_sub(prev.tx_bytes),
    ) else {
        debug!(
            prev_rx = prev.rx_bytes,
            curr_rx = curr.rx_bytes,
            prev_tx = prev.tx_bytes,
            curr_tx = curr.tx_bytes,
            "Counter went backwards, dropping sample"
        );
        return None;
    };

    let secs = period.as_secs_f64().max(1e-3);
    Some(ThroughputSample {
        time: curr.captured_at.format("%H:%M:%S").to_string(),
        rx_mbps: bytes_to_megabits(rx_delta as f64) / secs,
        tx_mbps: bytes_to_megabits(tx_delta as f64) / secs,
    })
}

/// Turns successive counter snapshots into throughput samples.
///
/// Holds exactly one baseline. Every call replaces it, whether or not a
/// sample comes out, so the current reading is always the next delta's start.
pub struct RateSampler {
    period: Duration,
    baseline: Option<CounterSnapshot>,
}

impl RateSampler {
    pub fn new(period: Duration) -> Self {
        Self { period, baseline: None }
    }

    pub fn sample(&mut self, curr: CounterSnapshot) -> Option<ThroughputSample> {
        let prev = self.baseline.replace(curr);
        let curr = self.baseline.as_ref()?;
        rate_between(prev.as_ref()?, curr, self.period)
    }

    #[cfg(test)]
    pub fn baseline(&self) -> Option<&CounterSnapshot> {
        self.baseline.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(rx: u64, tx: u64) -> CounterSnapshot {
        CounterSnapshot::now(rx, tx)
    }

    #[test]
    fn first_snapshot_only_sets_baseline() {
        let mut sampler = RateSampler::new(Duration::from_secs(1));
        assert!(sampler.sample(snap(1000, 500)).is_none());
        assert_eq!(sampler.baseline().map(|b| b.rx_bytes), Some(1000));
    }

    #[test]
    fn one_second_delta_converts_to_mbps() {
        let mut sampler = RateSampler::new(Duration::from_secs(1));
        sampler.sample(snap(1000, 500));
        let s = sampler.sample(snap(126_000, 63_000)).unwrap();
        assert!((s.rx_mbps - 1.0).abs() < 1e-9);
        assert!((s.tx_mbps - 0.5).abs() < 1e-9);
    }

    #[test]
    fn rate_scales_with_period() {
        let prev = snap(0, 0);
        let curr = snap(250_000, 0);
        let s = rate_between(&prev, &curr, Duration::from_secs(2)).unwrap();
        assert!((s.rx_mbps - 1.0).abs() < 1e-9);
        assert_eq!(s.tx_mbps, 0.0);
    }

    #[test]
    fn counter_reset_is_dropped_not_clamped() {
        let mut sampler = RateSampler::new(Duration::from_secs(1));
        sampler.sample(snap(5_000_000, 100));
        // rx reset to near zero, tx still growing
        assert!(sampler.sample(snap(10, 200)).is_none());
        assert_eq!(sampler.baseline().map(|b| b.rx_bytes), Some(10));

        // next cycle measures from the post-reset baseline
        let s = sampler.sample(snap(125_010, 200)).unwrap();
        assert!((s.rx_mbps - 1.0).abs() < 1e-9);
        assert_eq!(s.tx_mbps, 0.0);
    }

    #[test]
    fn tx_reset_alone_drops_sample() {
        let prev = snap(100, 900);
        let curr = snap(200, 0);
        assert!(rate_between(&prev, &curr, Duration::from_secs(1)).is_none());
    }

    #[test]
    fn sample_carries_time_label() {
        let prev = snap(0, 0);
        let curr = snap(0, 0);
        let s = rate_between(&prev, &curr, Duration::from_secs(1)).unwrap();
        assert_eq!(s.time, curr.captured_at.format("%H:%M:%S").to_string());
        assert_eq!(s.time.len(), 8);
    }
}
