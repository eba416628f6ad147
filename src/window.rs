use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::time::Duration;

use thiserror::Error;

use crate::metrics::ThroughputSample;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowError {
    #[error("window capacity must be at least one sample")]
    ZeroCapacity,
    #[error("sampling period must be greater than zero")]
    ZeroPeriod,
}

/// Retention and sampling cadence of a live window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowConfig {
    pub retention: Duration,
    pub period: Duration,
}

impl WindowConfig {
    /// Number of samples needed to cover `retention` at one sample per `period`.
    pub fn capacity(&self) -> Result<NonZeroUsize, WindowError> {
        let period = self.period.as_millis();
        if period == 0 {
            return Err(WindowError::ZeroPeriod);
        }
        let samples = (self.retention.as_millis() + period - 1) / period;
        let samples = usize::try_from(samples).unwrap_or(usize::MAX);
        NonZeroUsize::new(samples).ok_or(WindowError::ZeroCapacity)
    }
}

/// Appends `sample` and drops the single oldest entry if the result would
/// exceed `capacity`. Leaves `window` untouched. Reference form of
/// [`SlidingWindow::push`], which the monitor uses.
#[cfg(test)]
pub fn push(
    window: &[ThroughputSample],
    sample: ThroughputSample,
    capacity: NonZeroUsize,
) -> Vec<ThroughputSample> {
    let skip = usize::from(window.len() >= capacity.get());
    let mut next = Vec::with_capacity(capacity.get());
    next.extend(window.iter().skip(skip).cloned());
    next.push(sample);
    next
}

/// Bounded, chronologically ordered buffer of throughput samples.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    capacity: NonZeroUsize,
    samples: VecDeque<ThroughputSample>,
}

impl SlidingWindow {
    pub fn new(capacity: usize) -> Result<Self, WindowError> {
        let capacity = NonZeroUsize::new(capacity).ok_or(WindowError::ZeroCapacity)?;
        Ok(Self { capacity, samples: VecDeque::with_capacity(capacity.get()) })
    }

    pub fn from_config(config: &WindowConfig) -> Result<Self, WindowError> {
        Self::new(config.capacity()?.get())
    }

    /// Appends `sample`, evicting exactly the oldest entry once full.
    pub fn push(&mut self, sample: ThroughputSample) {
        if self.len() >= self.capacity() {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn latest(&self) -> Option<&ThroughputSample> {
        self.samples.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ThroughputSample> + '_ {
        self.samples.iter()
    }

    /// Owned copy, oldest first, for rendering outside the state lock.
    pub fn snapshot(&self) -> Vec<ThroughputSample> {
        self.iter().cloned().collect()
    }
}

impl<'a> IntoIterator for &'a SlidingWindow {
    type Item = &'a ThroughputSample;
    type IntoIter = std::collections::vec_deque::Iter<'a, ThroughputSample>;

    fn into_iter(self) -> Self::IntoIter {
        self.samples.iter()
    }
}
