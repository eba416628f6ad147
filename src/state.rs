use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;

use crate::aggregate::{summarize, Channel, Summary};
use crate::history::SpeedTestRecord;
use crate::metrics::{CounterSnapshot, RateSampler, ThroughputSample};
use crate::source::PingStatus;
use crate::window::SlidingWindow;

struct Pipeline {
    sampler: RateSampler,
    window: SlidingWindow,
}

/// State shared between the sampling, probing and speed-test threads and the UI.
pub struct LiveState {
    // sampler baseline and window change together, under one lock
    pipeline: Mutex<Pipeline>,
    // latest probe result per endpoint
    pub pings: DashMap<String, PingStatus>,
    history: Mutex<Vec<SpeedTestRecord>>,
    speed_test_running: AtomicBool,
}

impl std::fmt::Debug for LiveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveState")
            .field("pings", &self.pings.len())
            .field("speed_test_running", &self.speed_test_running())
            .finish_non_exhaustive()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // every critical section is a single step, so a poisoned lock still holds consistent data
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LiveState {
    pub fn new(window: SlidingWindow, period: Duration) -> Self {
        Self {
            pipeline: Mutex::new(Pipeline { sampler: RateSampler::new(period), window }),
            pings: DashMap::new(),
            history: Mutex::new(Vec::new()),
            speed_test_running: AtomicBool::new(false),
        }
    }

    /// Feeds one snapshot through the sampler and, if a sample comes out,
    /// into the window. Both happen under the same lock.
    pub fn ingest(&self, snapshot: CounterSnapshot) -> Option<ThroughputSample> {
        let mut p = lock(&self.pipeline);
        let sample = p.sampler.sample(snapshot)?;
        p.window.push(sample.clone());
        Some(sample)
    }

    pub fn window(&self) -> Vec<ThroughputSample> {
        lock(&self.pipeline).window.snapshot()
    }

    pub fn window_capacity(&self) -> usize {
        lock(&self.pipeline).window.capacity()
    }

    pub fn summary(&self, channel: Channel) -> Summary {
        summarize(&lock(&self.pipeline).window, channel)
    }

    pub fn current_rx_mbps(&self) -> f64 {
        lock(&self.pipeline).window.latest().map_or(0.0, |s| s.rx_mbps)
    }

    pub fn record_pings(&self, results: Vec<PingStatus>) {
        for r in results {
            self.pings.insert(r.address.clone(), r);
        }
    }

    /// Latest probe results in the order of `endpoints`; unprobed endpoints are skipped.
    pub fn pings_for(&self, endpoints: &[String]) -> Vec<PingStatus> {
        endpoints.iter().filter_map(|e| self.pings.get(e).map(|r| r.value().clone())).collect()
    }

    /// Replaces the cached history with a fresh newest-first listing.
    pub fn set_history(&self, records: Vec<SpeedTestRecord>) {
        *lock(&self.history) = records;
    }

    /// Adds a record that could not be persisted so it is still displayed.
    pub fn remember_unsaved(&self, record: SpeedTestRecord) {
        let mut history = lock(&self.history);
        history.retain(|r| r.timestamp != record.timestamp);
        let at = history.partition_point(|r| r.timestamp > record.timestamp);
        history.insert(at, record);
    }

    pub fn history(&self) -> Vec<SpeedTestRecord> {
        lock(&self.history).clone()
    }

    /// Claims the single speed-test slot; false if a test is already running.
    pub fn begin_speed_test(&self) -> bool {
        self.speed_test_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn end_speed_test(&self) {
        self.speed_test_running.store(false, Ordering::Release);
    }

    pub fn speed_test_running(&self) -> bool {
        self.speed_test_running.load(Ordering::Acquire)
    }
}
