use serde::Serialize;

use crate::metrics::ThroughputSample;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Channel {
    Rx,
    Tx,
}

impl Channel {
    pub fn value(self, sample: &ThroughputSample) -> f64 {
        match self {
            Channel::Rx => sample.rx_mbps,
            Channel::Tx => sample.tx_mbps,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Channel::Rx => "RX",
            Channel::Tx => "TX",
        }
    }
}

/// Descriptive statistics of one channel over a window, in Mbit/s.
///
/// Every field is 0 for an empty window; none of them is ever NaN.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Summary {
    pub current: f64,
    pub mean: f64,
    pub median: f64,
    pub max: f64,
}

pub fn summarize<'a, I>(samples: I, channel: Channel) -> Summary
where
    I: IntoIterator<Item = &'a ThroughputSample>,
{
    let values: Vec<f64> = samples.into_iter().map(|s| finite_or_zero(channel.value(s))).collect();
    Summary {
        current: current(&values),
        mean: mean(&values),
        median: median(&values),
        max: max(&values),
    }
}

pub fn current(values: &[f64]) -> f64 {
    values.last().copied().unwrap_or(0.0)
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    finite_or_zero(values.iter().sum::<f64>() / values.len() as f64)
}

/// Upper median: the element at `n / 2` after an ascending sort. For even
/// lengths this is the higher of the two middle values, not their average.
pub fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    sorted.get(sorted.len() / 2).copied().map_or(0.0, finite_or_zero)
}

pub fn max(values: &[f64]) -> f64 {
    values.iter().copied().fold(0.0, f64::max)
}

fn finite_or_zero(v: f64) -> f64 {
    if v.is_finite() { v } else { 0.0 }
}
