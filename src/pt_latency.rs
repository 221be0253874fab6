// Latency recording and descriptive statistics
//
// One recorder per participant, written only by the execution context that
// owns that participant. Statistics are never kept incrementally: every call
// to `compute_stats` is a pure function of the raw samples and counters.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::pt_interface::SequenceId;

// ============================================================================
// Samples
// ============================================================================

/// One completed exchange. Appended once, read-only afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub sent_at: Instant,
    pub received_at: Instant,
    pub sequence: SequenceId,
}

impl Sample {
    pub fn new(sent_at: Instant, received_at: Instant, sequence: SequenceId) -> Self {
        Self {
            sent_at,
            received_at,
            sequence,
        }
    }

    pub fn latency(&self) -> Duration {
        self.received_at.saturating_duration_since(self.sent_at)
    }
}

// ============================================================================
// Lateness thresholds
// ============================================================================

/// Latency limits above which a sample is flagged late or too late.
///
/// The limit is the larger of a percentage of the producer period and an
/// absolute floor; event-driven producers (no period) use the floor only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatenessThresholds {
    pub late: Duration,
    pub too_late: Duration,
}

impl LatenessThresholds {
    pub const LATE_PERCENTAGE: u32 = 20;
    pub const LATE_ABSOLUTE: Duration = Duration::from_millis(5);
    pub const TOO_LATE_PERCENTAGE: u32 = 100;
    pub const TOO_LATE_ABSOLUTE: Duration = Duration::from_millis(50);

    pub fn for_period(period: Option<Duration>) -> Self {
        let scaled = |percentage: u32| {
            period
                .map(|p| p * percentage / 100)
                .unwrap_or(Duration::ZERO)
        };

        Self {
            late: scaled(Self::LATE_PERCENTAGE).max(Self::LATE_ABSOLUTE),
            too_late: scaled(Self::TOO_LATE_PERCENTAGE).max(Self::TOO_LATE_ABSOLUTE),
        }
    }
}

impl Default for LatenessThresholds {
    fn default() -> Self {
        Self::for_period(None)
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Descriptive latency statistics, all in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencySummary {
    pub min_us: f64,
    pub max_us: f64,
    pub mean_us: f64,
    pub stddev_us: f64,
}

impl LatencySummary {
    /// Population statistics over a set of samples, `None` if the set is empty.
    ///
    /// The sum is accumulated in integer nanoseconds so that the mean of equal
    /// values is exact and always lies within [min, max].
    pub fn from_samples<'a, I>(samples: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a Sample>,
    {
        let latencies: Vec<u128> = samples
            .into_iter()
            .map(|s| s.latency().as_nanos())
            .collect();

        if latencies.is_empty() {
            return None;
        }

        let n = latencies.len() as f64;
        let min = *latencies.iter().min()?;
        let max = *latencies.iter().max()?;
        let sum: u128 = latencies.iter().sum();
        let mean_ns = sum as f64 / n;

        let variance = latencies
            .iter()
            .map(|&l| {
                let d = l as f64 - mean_ns;
                d * d
            })
            .sum::<f64>()
            / n;

        Some(Self {
            min_us: min as f64 / 1000.0,
            max_us: max as f64 / 1000.0,
            mean_us: mean_ns / 1000.0,
            stddev_us: variance.sqrt() / 1000.0,
        })
    }
}

/// Result of `LatencyRecorder::compute_stats`.
///
/// `latency` is `None` when there are no samples ("no data"), which is a
/// well-defined result rather than an error.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Default)]
pub struct LatencyStats {
    /// Number of samples the latency figures are computed from
    pub count: usize,
    /// Messages attempted by this participant
    pub sent_count: u64,
    /// Messages actually observed by this participant
    pub received_count: u64,
    /// Sends rejected by the transport
    pub send_failures: u64,
    /// Messages known to be missing (unanswered requests, sequence gaps)
    pub lost: u64,
    pub late: u64,
    pub too_late: u64,
    pub latency: Option<LatencySummary>,
}

impl LatencyStats {
    pub fn min_us(&self) -> Option<f64> {
        self.latency.map(|l| l.min_us)
    }

    pub fn max_us(&self) -> Option<f64> {
        self.latency.map(|l| l.max_us)
    }

    pub fn mean_us(&self) -> Option<f64> {
        self.latency.map(|l| l.mean_us)
    }

    pub fn stddev_us(&self) -> Option<f64> {
        self.latency.map(|l| l.stddev_us)
    }
}

// ============================================================================
// Recorder
// ============================================================================

/// Append-only accumulator of samples and delivery counters for one participant.
#[derive(Debug, Clone, Default)]
pub struct LatencyRecorder {
    samples: Vec<Sample>,
    sent_count: u64,
    received_count: u64,
    send_failures: u64,
    lost: u64,
    thresholds: LatenessThresholds,
}

impl LatencyRecorder {
    pub fn new(thresholds: LatenessThresholds) -> Self {
        Self {
            thresholds,
            ..Self::default()
        }
    }

    /// Record a completed exchange. Also counts as one received message.
    pub fn record(&mut self, sample: Sample) {
        self.samples.push(sample);
        self.received_count += 1;
    }

    pub fn record_sent(&mut self) {
        self.sent_count += 1;
    }

    pub fn record_send_failure(&mut self) {
        self.send_failures += 1;
    }

    pub fn record_lost(&mut self, count: u64) {
        self.lost += count;
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn thresholds(&self) -> LatenessThresholds {
        self.thresholds
    }

    pub fn late_count(&self) -> u64 {
        self.samples
            .iter()
            .filter(|s| {
                let latency = s.latency();
                latency > self.thresholds.late && latency <= self.thresholds.too_late
            })
            .count() as u64
    }

    pub fn too_late_count(&self) -> u64 {
        self.samples
            .iter()
            .filter(|s| s.latency() > self.thresholds.too_late)
            .count() as u64
    }

    pub fn compute_stats(&self) -> LatencyStats {
        LatencyStats {
            count: self.samples.len(),
            sent_count: self.sent_count,
            received_count: self.received_count,
            send_failures: self.send_failures,
            lost: self.lost,
            late: self.late_count(),
            too_late: self.too_late_count(),
            latency: LatencySummary::from_samples(&self.samples),
        }
    }

    /// Statistics over the union of several recorders' raw samples, as if they
    /// had all been recorded by one recorder. Counters are summed.
    pub fn merged_stats<'a, I>(recorders: I) -> LatencyStats
    where
        I: IntoIterator<Item = &'a LatencyRecorder>,
    {
        let recorders: Vec<&LatencyRecorder> = recorders.into_iter().collect();

        LatencyStats {
            count: recorders.iter().map(|r| r.samples.len()).sum(),
            sent_count: recorders.iter().map(|r| r.sent_count).sum(),
            received_count: recorders.iter().map(|r| r.received_count).sum(),
            send_failures: recorders.iter().map(|r| r.send_failures).sum(),
            lost: recorders.iter().map(|r| r.lost).sum(),
            late: recorders.iter().map(|r| r.late_count()).sum(),
            too_late: recorders.iter().map(|r| r.too_late_count()).sum(),
            latency: LatencySummary::from_samples(recorders.iter().flat_map(|r| r.samples.iter())),
        }
    }
}
