// Calibration module - sound card clock drift against a 1 Hz reference
//
// The capture clock is only nominally 44100 Hz; a cheap card can be off by
// seconds per day, which lands directly in the rate measurement. Feeding
// the machine a once-per-second reference (radio time signal, GPS pip)
// lets the drift be measured and folded back into the rate math.
//
// The calibration workflow:
// 1. The largest analysis window folds at exactly one second per cycle
// 2. Each fold contributes one phase sample: where the reference edge
//    falls inside the capture clock's second
// 3. A least-squares line through (elapsed, phase) is the drift; its
//    slope standard error is the confidence

use serde::Serialize;

use crate::error::{AnalysisError, AnalysisResult};

/// Drift estimates whose standard error exceeds this many seconds per day
/// are reported as failed.
pub const CONFIDENCE_LIMIT: f64 = 0.1;
/// Phase samples closer together than this are the same window seen twice.
const DEDUP_SECONDS: f64 = 0.9;
/// The rising edge is where the fold first reaches this fraction of its
/// peak, walking backwards from the peak bin.
const EDGE_THRESHOLD_RATIO: f32 = 0.95;

/// Result of a completed drift calibration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DriftEstimate {
    /// Capture clock drift in seconds per day. Positive means the clock
    /// counts fast, so every measured rate reads high without correction.
    pub seconds_per_day: f64,
    /// Standard error of the fitted slope, in seconds per day.
    pub confidence: f64,
    /// Number of phase samples behind the fit.
    pub samples: usize,
}

impl DriftEstimate {
    pub fn is_confident(&self) -> bool {
        self.confidence < CONFIDENCE_LIMIT
    }
}

/// Sub-bin position of the rising edge leading into the fold peak.
///
/// Walks back from the peak until the fold drops below 95% of it, then
/// interpolates the crossing between that bin and the next. A plateau
/// wider than a quarter period has no usable edge.
fn rising_edge_position(folded: &[f32], max_bin: usize) -> AnalysisResult<f64> {
    let n = folded.len();
    if n == 0 || max_bin >= n || folded[max_bin] <= 0.0 {
        return Err(AnalysisError::CalibrationEdgeNotFound);
    }
    let threshold = EDGE_THRESHOLD_RATIO * folded[max_bin];
    let mut j = max_bin;
    for _ in 0..n / 4 {
        let prev = (j + n - 1) % n;
        if folded[prev] < threshold {
            // folded[j] is still at or above the threshold here, so the
            // rise through it is strictly positive.
            let rise = folded[j] - folded[prev];
            let frac = (threshold - folded[prev]) / rise;
            return Ok((prev as f64 + frac as f64).rem_euclid(n as f64));
        }
        j = prev;
    }
    Err(AnalysisError::CalibrationEdgeNotFound)
}

/// Collects reference phase samples across analysis cycles and fits the
/// drift once enough have arrived.
pub struct CalibrationAccumulator {
    capacity: usize,
    /// (elapsed seconds, edge phase in seconds within [0, 1)).
    samples: Vec<(f64, f64)>,
    result: Option<DriftEstimate>,
}

impl CalibrationAccumulator {
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity >= 3, "a line fit needs at least three samples");
        Self {
            capacity,
            samples: Vec::with_capacity(capacity),
            result: None,
        }
    }

    /// Throw away collected samples and any finished estimate.
    pub fn clear(&mut self) {
        self.samples.clear();
        self.result = None;
    }

    /// Collected fraction of the required samples, for progress display.
    pub fn progress(&self) -> f32 {
        self.samples.len() as f32 / self.capacity as f32
    }

    pub fn is_complete(&self) -> bool {
        self.result.is_some()
    }

    pub fn result(&self) -> Option<DriftEstimate> {
        self.result
    }

    /// Feed one folded reference window.
    ///
    /// `folded` must be the one-second fold of the window ending at
    /// `end_timestamp`, with its peak at `max_bin`. Completing the fit
    /// with a confident estimate returns `Ok`; completing it without one
    /// returns the low-confidence error. Either way the result is stored
    /// and later ingests become no-ops until [`clear`](Self::clear).
    pub fn ingest(
        &mut self,
        folded: &[f32],
        max_bin: usize,
        window_start: u64,
        end_timestamp: u64,
        sample_rate: u32,
    ) -> AnalysisResult<()> {
        if self.result.is_some() {
            return Ok(());
        }
        let edge = rising_edge_position(folded, max_bin)?;
        let rate = sample_rate as f64;
        let phase = (window_start as f64 + edge).rem_euclid(rate) / rate;
        let elapsed = end_timestamp as f64 / rate;

        if let Some(&(last, _)) = self.samples.last() {
            if elapsed - last < DEDUP_SECONDS {
                return Ok(());
            }
        }
        self.samples.push((elapsed, phase));
        if self.samples.len() < self.capacity {
            return Ok(());
        }

        let estimate = self.fit();
        self.result = Some(estimate);
        if estimate.is_confident() {
            Ok(())
        } else {
            Err(AnalysisError::CalibrationLowConfidence {
                confidence: estimate.confidence,
                limit: CONFIDENCE_LIMIT,
            })
        }
    }

    /// Least-squares drift through the collected phases.
    ///
    /// Phases live on a circle, so they are first centered on their
    /// circular mean and unwrapped into [-0.5, 0.5) turns; a drift that
    /// legitimately crosses the second boundary still fits as a line.
    fn fit(&self) -> DriftEstimate {
        let m = self.samples.len();
        let turns = std::f64::consts::TAU;
        let (mut sin_sum, mut cos_sum) = (0.0f64, 0.0f64);
        for &(_, phase) in &self.samples {
            sin_sum += (turns * phase).sin();
            cos_sum += (turns * phase).cos();
        }
        let center = sin_sum.atan2(cos_sum) / turns;

        let mut t_mean = 0.0;
        let mut d_mean = 0.0;
        let centered: Vec<(f64, f64)> = self
            .samples
            .iter()
            .map(|&(t, phase)| {
                let mut d = phase - center;
                d -= d.round();
                t_mean += t;
                d_mean += d;
                (t, d)
            })
            .collect();
        t_mean /= m as f64;
        d_mean /= m as f64;

        let mut tt = 0.0;
        let mut td = 0.0;
        for &(t, d) in &centered {
            tt += (t - t_mean) * (t - t_mean);
            td += (t - t_mean) * (d - d_mean);
        }
        let slope = if tt > 0.0 { td / tt } else { 0.0 };

        let mut residual_sq = 0.0;
        for &(t, d) in &centered {
            let r = d - d_mean - slope * (t - t_mean);
            residual_sq += r * r;
        }
        let standard_error = if m > 2 && tt > 0.0 {
            (residual_sq / (m as f64 - 2.0) / tt).sqrt()
        } else {
            f64::INFINITY
        };

        DriftEstimate {
            seconds_per_day: slope * 86_400.0,
            confidence: standard_error * 86_400.0,
            samples: m,
        }
    }
}
