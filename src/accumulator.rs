use crate::error::DigestError;
use serde::Serialize;

/// Latency statistics for one fingerprint. All values are nanoseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LatencySummary {
    pub count: u64,
    pub cumulative: u64,
    pub min: u64,
    pub max: u64,
    pub range: u64,
    /// Truncated arithmetic mean.
    pub mean: u64,
    /// Harmonic mean over the non-zero samples, rounded; 0 if every sample is 0.
    pub hmean: u64,
    /// Population standard deviation, rounded.
    pub stddev: u64,
    pub p50: u64,
    pub p75: u64,
    pub p95: u64,
    pub p99: u64,
    pub p999: u64,
    /// Mean of the slowest 5% of samples.
    pub long_5p: u64,
    /// Mean of the fastest 5% of samples.
    pub short_5p: u64,
}

/// Collects the durations routed to a single fingerprint.
///
/// `count`, `cumulative`, `min` and `max` are kept up to date on every
/// [`add`](Self::add); everything else is derived by [`summarize`](Self::summarize)
/// from an exact sort of the samples, which consumes the accumulator.
#[derive(Debug, Clone)]
pub struct LatencyAccumulator {
    samples: Vec<u64>,
    cumulative: u64,
    min: u64,
    max: u64,
}

impl Default for LatencyAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyAccumulator {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Pre-sizes the sample buffer when the final count is known.
    pub fn with_capacity(expected: usize) -> Self {
        Self {
            samples: Vec::with_capacity(expected),
            cumulative: 0,
            min: u64::MAX,
            max: 0,
        }
    }

    /// Adds one duration. Returns `None`, leaving the accumulator untouched,
    /// if the cumulative sum would overflow.
    #[must_use]
    pub fn add(&mut self, nanos: u64) -> Option<()> {
        self.cumulative = self.cumulative.checked_add(nanos)?;
        self.min = self.min.min(nanos);
        self.max = self.max.max(nanos);
        self.samples.push(nanos);
        Some(())
    }

    pub fn summarize(mut self) -> Result<LatencySummary, DigestError> {
        if self.samples.is_empty() {
            return Err(DigestError::EmptyAccumulator);
        }

        self.samples.sort_unstable();
        let times = &self.samples;
        let count = times.len() as u64;
        let mean = self.cumulative / count;

        Ok(LatencySummary {
            count,
            cumulative: self.cumulative,
            min: self.min,
            max: self.max,
            range: self.max - self.min,
            mean,
            hmean: harmonic_mean(times),
            stddev: std_dev(times, self.cumulative as f64 / count as f64),
            p50: percentile(times, 0.50),
            p75: percentile(times, 0.75),
            p95: percentile(times, 0.95),
            p99: percentile(times, 0.99),
            p999: percentile(times, 0.999),
            long_5p: tail_mean(&times[tail_start(times.len())..]),
            short_5p: tail_mean(&times[..head_len(times.len())]),
        })
    }
}

/// Nearest-rank percentile over sorted samples: the value at 1-based rank
/// `ceil(p * n)`, clamped to `[1, n]`.
fn percentile(sorted: &[u64], p: f64) -> u64 {
    let rank = (sorted.len() as f64 * p).ceil() as usize;
    let idx = rank.clamp(1, sorted.len()) - 1;
    sorted[idx]
}

// Slowest 5%, never fewer than one sample.
fn tail_start(len: usize) -> usize {
    let start = (len as f64 * 0.95).floor() as usize;
    start.min(len - 1)
}

// Fastest 5%, never fewer than one sample.
fn head_len(len: usize) -> usize {
    ((len as f64 * 0.05).ceil() as usize).max(1)
}

fn tail_mean(slice: &[u64]) -> u64 {
    let sum: u128 = slice.iter().map(|&t| t as u128).sum();
    (sum / slice.len() as u128) as u64
}

fn harmonic_mean(sorted: &[u64]) -> u64 {
    let (n, reciprocal_sum) = sorted
        .iter()
        .filter(|&&t| t > 0)
        .fold((0u64, 0f64), |(n, acc), &t| (n + 1, acc + 1.0 / t as f64));
    if n == 0 {
        return 0;
    }
    (n as f64 / reciprocal_sum).round() as u64
}

fn std_dev(sorted: &[u64], mean: f64) -> u64 {
    let variance = sorted
        .iter()
        .map(|&t| {
            let d = t as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / sorted.len() as f64;
    variance.sqrt().round() as u64
}
