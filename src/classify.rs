use serde::Serialize;

/// Qualitative rating of a measured value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Band {
    Good,
    Okay,
    Bad,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Direction {
    LowerIsBetter,
    HigherIsBetter,
}

/// Cutoffs for one metric; a value equal to a cutoff falls into the better band.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub good: f64,
    pub okay: f64,
    direction: Direction,
}

impl Thresholds {
    pub const fn lower_is_better(good: f64, okay: f64) -> Self {
        Self { good, okay, direction: Direction::LowerIsBetter }
    }

    pub const fn higher_is_better(good: f64, okay: f64) -> Self {
        Self { good, okay, direction: Direction::HigherIsBetter }
    }

    pub fn band(&self, value: f64) -> Band {
        let within = |cutoff: f64| match self.direction {
            Direction::LowerIsBetter => value <= cutoff,
            Direction::HigherIsBetter => value >= cutoff,
        };
        if within(self.good) {
            Band::Good
        } else if within(self.okay) {
            Band::Okay
        } else {
            Band::Bad
        }
    }
}

// milliseconds
pub const PING_THRESHOLDS: Thresholds = Thresholds::lower_is_better(30.0, 50.0);
pub const LATENCY_THRESHOLDS: Thresholds = Thresholds::lower_is_better(70.0, 100.0);
pub const JITTER_THRESHOLDS: Thresholds = Thresholds::lower_is_better(10.0, 20.0);
// Mbit/s
pub const DOWNLOAD_THRESHOLDS: Thresholds = Thresholds::higher_is_better(600.0, 400.0);
pub const UPLOAD_THRESHOLDS: Thresholds = Thresholds::higher_is_better(10.0, 5.0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Ping,
    Latency,
    Jitter,
    DownloadSpeed,
    UploadSpeed,
}

impl MetricKind {
    pub fn thresholds(self) -> Thresholds {
        match self {
            MetricKind::Ping => PING_THRESHOLDS,
            MetricKind::Latency => LATENCY_THRESHOLDS,
            MetricKind::Jitter => JITTER_THRESHOLDS,
            MetricKind::DownloadSpeed => DOWNLOAD_THRESHOLDS,
            MetricKind::UploadSpeed => UPLOAD_THRESHOLDS,
        }
    }
}

pub fn classify(kind: MetricKind, value: Option<f64>) -> Band {
    match value {
        Some(v) if !v.is_nan() => kind.thresholds().band(v),
        _ => Band::None,
    }
}
