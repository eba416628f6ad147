use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel as channel;
use tracing::{debug, error, info, warn};

use crate::aggregate::Channel;
use crate::cli::Monitor;
use crate::config::{MonitorConfig, SPEED_TEST_BUSY_MBPS};
use crate::history::{HistoryError, HistoryStore, SpeedTestRecord};
use crate::metrics::ThroughputSample;
use crate::mock::{MockBandwidthTest, MockCounters, MockProbe};
use crate::source::{
    BandwidthTest, CounterSource, LatencyProbe, ProbeStatus, SourceError, SpeedtestCli, SystemCounters, SystemPing,
};
use crate::state::LiveState;
use crate::ui::overview::run_tui;
use crate::window::SlidingWindow;

const POLL: Duration = Duration::from_millis(200);
const HEADLESS_REPORT_EVERY: Duration = Duration::from_secs(5);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Reports a worker's name on `done` when it exits, including by panic.
struct Finished {
    name: &'static str,
    done: channel::Sender<&'static str>,
}

impl Drop for Finished {
    fn drop(&mut self) {
        let _ = self.done.send(self.name);
    }
}

fn spawn_worker<F>(name: &'static str, done: &channel::Sender<&'static str>, f: F) -> (&'static str, JoinHandle<()>)
where
    F: FnOnce() + Send + 'static,
{
    let finished = Finished { name, done: done.clone() };
    let handle = thread::spawn(move || {
        let _finished = finished;
        f();
    });
    (name, handle)
}

/// Joins every worker that reports back before `grace` runs out. The rest are
/// detached; their names are returned.
fn join_workers(
    workers: Vec<(&'static str, JoinHandle<()>)>,
    done: &channel::Receiver<&'static str>,
    grace: Duration,
) -> Vec<&'static str> {
    let deadline = Instant::now() + grace;
    let mut pending = workers;
    while !pending.is_empty() {
        let Ok(name) = done.recv_deadline(deadline) else {
            break;
        };
        if let Some(i) = pending.iter().position(|(n, _)| *n == name) {
            let (_, handle) = pending.swap_remove(i);
            if handle.join().is_err() {
                warn!(thread = name, "Worker panicked during shutdown");
            }
        }
    }
    pending
        .into_iter()
        .map(|(name, _)| {
            warn!(thread = name, "Worker still busy at shutdown, abandoning it");
            name
        })
        .collect()
}

pub struct Collaborators {
    pub counters: Box<dyn CounterSource>,
    pub probe: Box<dyn LatencyProbe>,
    pub bandwidth: Box<dyn BandwidthTest>,
}

impl Collaborators {
    pub fn for_config(config: &MonitorConfig) -> Result<Self> {
        if config.mock {
            return Ok(Self {
                counters: Box::new(MockCounters::new(120)),
                probe: Box::new(MockProbe),
                bandwidth: Box::new(MockBandwidthTest::new(Duration::from_secs(3))),
            });
        }
        let counters = SystemCounters::open(config.interface.as_deref()).context("Opening interface counters")?;
        info!(interface = counters.interface(), "Watching interface");
        Ok(Self {
            counters: Box::new(counters),
            probe: Box::new(SystemPing::default()),
            bandwidth: Box::new(SpeedtestCli::default()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Manual,
    Scheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerRefusal {
    LinkBusy,
    AlreadyRunning,
    AlreadyQueued,
}

/// Queues a manual speed test unless the link is busy or one is already
/// running or queued.
pub fn request_speed_test(state: &LiveState, triggers: &channel::Sender<Trigger>) -> Result<(), TriggerRefusal> {
    if state.current_rx_mbps() > SPEED_TEST_BUSY_MBPS {
        return Err(TriggerRefusal::LinkBusy);
    }
    if state.speed_test_running() {
        return Err(TriggerRefusal::AlreadyRunning);
    }
    triggers.try_send(Trigger::Manual).map_err(|_| TriggerRefusal::AlreadyQueued)
}

pub fn run_monitor(args: Monitor) -> Result<()> {
    let config = MonitorConfig::try_from(&args).context("Invalid monitor settings")?;
    let stop_flag = Arc::new(AtomicBool::new(false));
    {
        let stop = stop_flag.clone();
        let _ = ctrlc::set_handler(move || {
            stop.store(true, Ordering::Relaxed);
        });
    }

    let sources = Collaborators::for_config(&config)?;
    run_monitor_with_shutdown(&config, sources, stop_flag).map(|_| ())
}

pub(crate) fn run_monitor_with_shutdown(
    config: &MonitorConfig,
    sources: Collaborators,
    stop_flag: Arc<AtomicBool>,
) -> Result<Arc<LiveState>> {
    let store = Arc::new(
        HistoryStore::open(&config.db).with_context(|| format!("Opening history at {}", config.db.display()))?,
    );
    let window = SlidingWindow::from_config(&config.window).context("Creating sample window")?;
    let state = Arc::new(LiveState::new(window, config.window.period));
    state.set_history(store.list_all().context("Loading speed-test history")?);
    info!(
        db = %config.db.display(),
        capacity = config.capacity,
        period_ms = config.window.period.as_millis() as u64,
        "Starting netpulse"
    );

    let (event_tx, event_rx) = channel::unbounded::<String>();
    let (trigger_tx, trigger_rx) = channel::bounded::<Trigger>(1);
    let Collaborators { counters, probe, bandwidth } = sources;

    let (done_tx, done_rx) = channel::unbounded::<&'static str>();

    // Counter sampling: never waits on the prober or a speed test
    let sampler = {
        let state = Arc::clone(&state);
        let stop = stop_flag.clone();
        let period = config.window.period;
        spawn_worker("sampler", &done_tx, move || {
            let mut counters = counters;
            let ticker = channel::tick(period);
            while !stop.load(Ordering::Relaxed) {
                if ticker.recv_timeout(POLL).is_ok() {
                    sample_once(counters.as_mut(), &state);
                }
            }
        })
    };

    let prober = {
        let state = Arc::clone(&state);
        let stop = stop_flag.clone();
        let period = config.ping_period;
        let endpoints = config.endpoints.clone();
        spawn_worker("prober", &done_tx, move || {
            let ticker = channel::tick(period);
            while !stop.load(Ordering::Relaxed) {
                probe_once(probe.as_ref(), &endpoints, &state);
                while !stop.load(Ordering::Relaxed) && ticker.recv_timeout(POLL).is_err() {}
            }
        })
    };

    let tester = {
        let state = Arc::clone(&state);
        let store = Arc::clone(&store);
        let stop = stop_flag.clone();
        let events = event_tx.clone();
        let schedule = config.speedtest_interval;
        spawn_worker("speed test", &done_tx, move || {
            speed_test_loop(bandwidth.as_ref(), &store, &state, &trigger_rx, schedule, &stop, &events);
        })
    };
    drop(done_tx);
    drop(event_tx);

    let shown = if config.headless {
        report_headless(&state, &event_rx, &stop_flag);
        Ok(())
    } else {
        run_tui(Arc::clone(&state), event_rx, trigger_tx, config.endpoints.clone(), stop_flag.clone())
    };
    // the UI may have failed before the user quit; stop the workers either way
    stop_flag.store(true, Ordering::Relaxed);

    info!("Shutting down");
    // a bandwidth test can outlive the grace period; its thread is left behind
    join_workers(vec![sampler, prober, tester], &done_rx, SHUTDOWN_GRACE);
    shown?;
    Ok(state)
}

/// One sampling cycle. The source is read without holding the state lock; a
/// failed read skips the cycle and leaves the baseline untouched.
pub(crate) fn sample_once(source: &mut dyn CounterSource, state: &LiveState) -> Option<ThroughputSample> {
    match source.snapshot() {
        Ok(snapshot) => state.ingest(snapshot),
        Err(e) => {
            warn!(?e, "Counter read failed, skipping cycle");
            None
        }
    }
}

pub(crate) fn probe_once(probe: &dyn LatencyProbe, endpoints: &[String], state: &LiveState) {
    let results = probe.probe(endpoints);
    for r in &results {
        if let ProbeStatus::Failed(reason) = &r.status {
            debug!(address = %r.address, %reason, "Ping failed");
        }
    }
    state.record_pings(results);
}

pub(crate) struct SpeedTestRun {
    pub record: SpeedTestRecord,
    pub saved: Result<(), HistoryError>,
}

/// Runs one bandwidth test and appends the result. A storage failure keeps
/// the record in memory and is returned to the caller in `saved`.
pub(crate) fn run_speed_test(
    test: &dyn BandwidthTest,
    store: &HistoryStore,
    state: &LiveState,
) -> Result<SpeedTestRun, SourceError> {
    let record = test.run()?;
    let saved = store.append(&record).and_then(|()| store.list_all()).map(|all| state.set_history(all));
    if let Err(e) = &saved {
        error!(?e, timestamp = record.timestamp, "Failed to persist speed test; keeping it in memory");
        state.remember_unsaved(record.clone());
    }
    Ok(SpeedTestRun { record, saved })
}

fn speed_test_loop(
    test: &dyn BandwidthTest,
    store: &HistoryStore,
    state: &LiveState,
    triggers: &channel::Receiver<Trigger>,
    schedule: Option<Duration>,
    stop: &AtomicBool,
    events: &channel::Sender<String>,
) {
    let ticker = schedule.map_or_else(channel::never, channel::tick);
    while !stop.load(Ordering::Relaxed) {
        let trigger = crossbeam_channel::select! {
            recv(triggers) -> t => match t {
                Ok(t) => t,
                Err(_) => break,
            },
            recv(ticker) -> _ => Trigger::Scheduled,
            default(POLL) => continue,
        };
        if !state.begin_speed_test() {
            continue;
        }
        let _ = events.send(format!("Speed test started ({trigger:?})"));
        info!(?trigger, "Speed test started");
        match run_speed_test(test, store, state) {
            Ok(run) => {
                let r = &run.record;
                info!(
                    download_mbps = r.download_mbps,
                    upload_mbps = r.upload_mbps,
                    latency_ms = r.latency_ms,
                    jitter_ms = r.jitter_ms,
                    "Speed test finished"
                );
                let _ = events.send(format!(
                    "Speed test: {:.2} down / {:.2} up Mb/s, {:.1} ms",
                    r.download_mbps, r.upload_mbps, r.latency_ms
                ));
                if let Err(e) = run.saved {
                    let _ = events.send(format!("History not saved: {e}"));
                }
            }
            Err(e) => {
                warn!(?e, "Speed test failed");
                let _ = events.send(format!("Speed test failed: {e}"));
            }
        }
        state.end_speed_test();
    }
}

fn report_headless(state: &LiveState, events: &channel::Receiver<String>, stop: &AtomicBool) {
    let ticker = channel::tick(HEADLESS_REPORT_EVERY);
    while !stop.load(Ordering::Relaxed) {
        crossbeam_channel::select! {
            recv(events) -> msg => match msg {
                Ok(m) => info!(event = %m, "Event"),
                // speed-test thread gone; keep reporting until stopped
                Err(_) => thread::sleep(POLL),
            },
            recv(ticker) -> _ => {
                let rx = state.summary(Channel::Rx);
                let tx = state.summary(Channel::Tx);
                info!(
                    rx_mbps = rx.current,
                    rx_mean = rx.mean,
                    rx_median = rx.median,
                    rx_max = rx.max,
                    tx_mbps = tx.current,
                    tx_mean = tx.mean,
                    tx_median = tx.median,
                    tx_max = tx.max,
                    "Throughput"
                );
            },
            default(POLL) => {},
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::CounterSnapshot;
    use crate::mock::ScriptedCounters;

    struct SlowTest(Duration);

    impl BandwidthTest for SlowTest {
        fn run(&self) -> Result<SpeedTestRecord, SourceError> {
            thread::sleep(self.0);
            MockBandwidthTest::new(Duration::ZERO).run()
        }
    }

    struct FailingTest;

    impl BandwidthTest for FailingTest {
        fn run(&self) -> Result<SpeedTestRecord, SourceError> {
            Err(SourceError::ToolFailed { tool: "speedtest", message: "offline".into() })
        }
    }

    fn state() -> LiveState {
        LiveState::new(SlidingWindow::new(10).unwrap(), Duration::from_secs(1))
    }

    fn mock_config(db: std::path::PathBuf) -> MonitorConfig {
        MonitorConfig {
            interface: None,
            window: crate::window::WindowConfig {
                retention: Duration::from_secs(1),
                period: Duration::from_millis(20),
            },
            capacity: 50,
            ping_period: Duration::from_millis(50),
            speedtest_interval: None,
            endpoints: vec!["1.1.1.1".into()],
            db,
            mock: true,
            headless: true,
        }
    }

    #[test]
    fn failed_read_skips_cycle_and_keeps_baseline() {
        let st = state();
        let mut src = ScriptedCounters::new([Some((0, 0)), None, Some((125_000, 0))]);
        assert!(sample_once(&mut src, &st).is_none());
        assert!(sample_once(&mut src, &st).is_none());
        // delta still measured from the first reading
        let s = sample_once(&mut src, &st).unwrap();
        assert!((s.rx_mbps - 1.0).abs() < 1e-9);
        assert_eq!(st.window().len(), 1);
    }

    #[test]
    fn speed_test_is_appended_and_listed() {
        let st = state();
        let store = HistoryStore::open_in_memory().unwrap();
        let test = MockBandwidthTest::new(Duration::ZERO);
        let first = run_speed_test(&test, &store, &st).unwrap();
        let second = run_speed_test(&test, &store, &st).unwrap();
        assert!(first.saved.is_ok() && second.saved.is_ok());
        let shown: Vec<i64> = st.history().iter().map(|r| r.timestamp).collect();
        assert_eq!(shown, vec![second.record.timestamp, first.record.timestamp]);
        assert_eq!(store.len().unwrap(), 2);
    }

    #[test]
    fn failed_speed_test_touches_nothing() {
        let st = state();
        let store = HistoryStore::open_in_memory().unwrap();
        assert!(run_speed_test(&FailingTest, &store, &st).is_err());
        assert!(st.history().is_empty());
        assert_eq!(store.len().unwrap(), 0);
    }

    #[test]
    fn storage_failure_keeps_record_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");
        let st = state();
        let store = HistoryStore::open(&path).unwrap();
        let test = MockBandwidthTest::new(Duration::ZERO);
        let saved = run_speed_test(&test, &store, &st).unwrap();
        assert!(saved.saved.is_ok());

        // table disappears underneath the store, so the next append fails
        rusqlite::Connection::open(&path).unwrap().execute_batch("DROP TABLE speed_test").unwrap();

        let unsaved = run_speed_test(&test, &store, &st).unwrap();
        assert!(matches!(unsaved.saved, Err(HistoryError::Sqlite(_))));
        let shown: Vec<i64> = st.history().iter().map(|r| r.timestamp).collect();
        assert_eq!(shown, vec![unsaved.record.timestamp, saved.record.timestamp]);
    }

    #[test]
    fn busy_link_refuses_manual_trigger() {
        let st = state();
        let (tx, rx) = channel::bounded(1);
        st.ingest(CounterSnapshot::now(0, 0));
        st.ingest(CounterSnapshot::now(1_250_000, 0)); // 10 Mb/s
        assert_eq!(request_speed_test(&st, &tx), Err(TriggerRefusal::LinkBusy));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn idle_link_queues_one_trigger() {
        let st = state();
        let (tx, rx) = channel::bounded(1);
        assert_eq!(request_speed_test(&st, &tx), Ok(()));
        assert_eq!(request_speed_test(&st, &tx), Err(TriggerRefusal::AlreadyQueued));
        assert_eq!(rx.try_recv().unwrap(), Trigger::Manual);

        assert!(st.begin_speed_test());
        assert_eq!(request_speed_test(&st, &tx), Err(TriggerRefusal::AlreadyRunning));
    }

    #[test]
    fn probe_results_land_in_state() {
        let st = state();
        let endpoints = vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()];
        probe_once(&MockProbe, &endpoints, &st);
        assert_eq!(st.pings_for(&endpoints).len(), 2);
    }

    #[test]
    fn headless_mock_run_samples_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let config = mock_config(dir.path().join("history.db"));
        let sources = Collaborators {
            counters: Box::new(MockCounters::new(0)),
            probe: Box::new(MockProbe),
            bandwidth: Box::new(MockBandwidthTest::new(Duration::ZERO)),
        };
        let stop = Arc::new(AtomicBool::new(false));
        let stopper = {
            let stop = stop.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(500));
                stop.store(true, Ordering::Relaxed);
            })
        };
        let state = run_monitor_with_shutdown(&config, sources, stop).unwrap();
        stopper.join().unwrap();
        assert!(!state.window().is_empty());
        assert!(!state.pings.is_empty());
    }

    #[test]
    fn unopenable_history_fails_startup() {
        let dir = tempfile::tempdir().unwrap();
        let config = mock_config(dir.path().join("missing").join("history.db"));
        let sources = Collaborators {
            counters: Box::new(MockCounters::new(0)),
            probe: Box::new(MockProbe),
            bandwidth: Box::new(MockBandwidthTest::new(Duration::ZERO)),
        };
        let err = run_monitor_with_shutdown(&config, sources, Arc::new(AtomicBool::new(true)))
            .err()
            .expect("startup must fail");
        assert!(err.chain().any(|c| c.downcast_ref::<HistoryError>().is_some()));
    }

    #[test]
    fn shutdown_abandons_in_flight_speed_test() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = mock_config(dir.path().join("history.db"));
        config.speedtest_interval = Some(Duration::from_millis(50));
        let sources = Collaborators {
            counters: Box::new(MockCounters::new(0)),
            probe: Box::new(MockProbe),
            bandwidth: Box::new(SlowTest(Duration::from_secs(30))),
        };
        let stop = Arc::new(AtomicBool::new(false));
        let stopper = {
            let stop = stop.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(500));
                stop.store(true, Ordering::Relaxed);
                Instant::now()
            })
        };
        let state = run_monitor_with_shutdown(&config, sources, stop).unwrap();
        let stopped_at = stopper.join().unwrap();
        assert!(stopped_at.elapsed() < SHUTDOWN_GRACE + Duration::from_secs(2));
        assert!(state.speed_test_running());
    }

    #[test]
    fn idle_workers_are_joined_and_busy_ones_reported() {
        let (done_tx, done_rx) = channel::unbounded();
        let quick = spawn_worker("quick", &done_tx, || {});
        let busy = spawn_worker("busy", &done_tx, || thread::sleep(Duration::from_secs(30)));
        let panicking = spawn_worker("panicking", &done_tx, || panic!("boom"));
        drop(done_tx);
        let abandoned = join_workers(vec![quick, busy, panicking], &done_rx, Duration::from_millis(300));
        assert_eq!(abandoned, vec!["busy"]);
    }
}
