use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::cli::Monitor;
use crate::units::minutes_to_seconds;
use crate::window::{WindowConfig, WindowError};

/// RX rate above which a manual speed test is refused; the link is busy and
/// the result would be skewed.
pub const SPEED_TEST_BUSY_MBPS: f64 = 1.0;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error(transparent)]
    Window(#[from] WindowError),
    #[error("ping period must be greater than zero")]
    ZeroPingPeriod,
    #[error("speed-test interval must be a non-negative number of minutes, got {0}")]
    BadSpeedtestInterval(f64),
    #[error("at least one ping endpoint is required")]
    NoEndpoints,
}

/// Validated settings of a monitor run.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub interface: Option<String>,
    pub window: WindowConfig,
    pub capacity: usize,
    pub ping_period: Duration,
    /// `None` when automatic speed tests are off
    pub speedtest_interval: Option<Duration>,
    pub endpoints: Vec<String>,
    pub db: PathBuf,
    pub mock: bool,
    pub headless: bool,
}

impl TryFrom<&Monitor> for MonitorConfig {
    type Error = ConfigError;

    fn try_from(args: &Monitor) -> Result<Self, Self::Error> {
        let window = WindowConfig {
            retention: Duration::from_secs(args.retention_secs),
            period: Duration::from_millis(args.period_ms),
        };
        let capacity = window.capacity()?.get();

        if args.ping_period_ms == 0 {
            return Err(ConfigError::ZeroPingPeriod);
        }
        let mins = args.speedtest_interval_mins;
        let speedtest_interval = match Duration::try_from_secs_f64(minutes_to_seconds(mins)) {
            Ok(d) if d.is_zero() => None,
            Ok(d) => Some(d),
            Err(_) => return Err(ConfigError::BadSpeedtestInterval(mins)),
        };
        if args.endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }

        Ok(Self {
            interface: args.interface.clone(),
            window,
            capacity,
            ping_period: Duration::from_millis(args.ping_period_ms),
            speedtest_interval,
            endpoints: args.endpoints.clone(),
            db: args.db.db.clone(),
            mock: args.mock,
            headless: args.headless,
        })
    }
}
