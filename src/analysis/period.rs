// Period estimation from the autocorrelation of a conditioned window.
//
// Pipeline per window:
// 1. Zero out transient bursts whose local energy dwarfs the typical tick
// 2. Rectify, low-pass, remove DC, taper the edges
// 3. Autocorrelate (done by the caller through the shared Correlator)
// 4. Coarse peak search, sub-harmonic walk, spacing disambiguation
// 5. Multi-cycle refinement into a mean period and its spread

use crate::dsp::stats::median;
use crate::dsp::Biquad;
use crate::error::{AnalysisError, AnalysisResult};

/// Lower bound of the coarse lag search: one twelfth of a second, i.e. at
/// most 43 200 beats per hour plus margin.
const COARSE_DIVISOR: u32 = 12;
/// A sub-harmonic replaces the coarse peak when its correlation holds at
/// least this fraction of it.
const SUBHARMONIC_RATIO: f32 = 0.9;
/// Correlation near 1.5x the candidate below this fraction of the peak
/// marks the candidate as the bare tic-to-toc spacing.
const HALF_SPACING_RATIO: f32 = 0.2;
/// More mid-level upward crossings than this means the range is periodic at
/// a finer scale than the candidate, not an isolated peak.
const MAX_MID_CROSSINGS: usize = 20;
/// Refinement searches each cycle within this fraction of the sample rate.
const REFINE_TOLERANCE_RATIO: f64 = 0.02;
/// Low-pass cutoff as a fraction of the sample rate; smooths the ring-down
/// inside each tick so correlation tracks the pulse envelope, not the
/// carrier phase.
const LOWPASS_CUTOFF_RATIO: f64 = 1.0 / 16.0;
/// Local-energy gate: samples are dropped when their neighborhood carries
/// more than twice the median per-block peak energy.
const NOISE_GATE_FACTOR: f64 = 2.0;

/// Build the low-pass section used by [`condition`].
pub(crate) fn conditioning_filter() -> Biquad {
    Biquad::lowpass(LOWPASS_CUTOFF_RATIO)
}

/// Zero out samples inside transient bursts.
///
/// Local energy is a short box sum of squares (10 ms). Each half second of
/// the window contributes its peak local energy; anything louder than twice
/// the median of those peaks is not a tick and gets silenced. A window of
/// ticks keeps its ticks: the per-block peaks ARE tick energy, so the gate
/// sits safely above them.
pub(crate) fn suppress_noise_bursts(
    samples: &mut [f32],
    sample_rate: u32,
    prefix: &mut Vec<f64>,
    scratch: &mut Vec<f32>,
) {
    let n = samples.len();
    let block = (sample_rate as usize) / 2;
    if block == 0 || n < 2 * block {
        return;
    }
    let box_len = ((sample_rate as usize) / 100).max(1);
    let half = box_len / 2;

    prefix.clear();
    prefix.reserve(n + 1);
    prefix.push(0.0);
    let mut acc = 0.0f64;
    for &s in samples.iter() {
        acc += (s as f64) * (s as f64);
        prefix.push(acc);
    }
    let local = |i: usize| -> f64 {
        let lo = i.saturating_sub(half);
        let hi = (i + half + 1).min(n);
        prefix[hi] - prefix[lo]
    };

    scratch.clear();
    let mut start = 0;
    while start + block <= n {
        let mut peak = 0.0f64;
        for i in start..start + block {
            let e = local(i);
            if e > peak {
                peak = e;
            }
        }
        scratch.push(peak as f32);
        start += block;
    }

    let med = median(scratch) as f64;
    if med <= 0.0 {
        return;
    }
    let gate = NOISE_GATE_FACTOR * med;
    for i in 0..n {
        if local(i) > gate {
            samples[i] = 0.0;
        }
    }
}

/// Rectify, low-pass, remove DC and taper the window edges in place.
pub(crate) fn condition(samples: &mut [f32], sample_rate: u32, lowpass: &mut Biquad) {
    for s in samples.iter_mut() {
        *s = s.abs();
    }

    lowpass.reset();
    lowpass.process(samples);

    let n = samples.len();
    if n == 0 {
        return;
    }
    let mean = (samples.iter().map(|&s| s as f64).sum::<f64>() / n as f64) as f32;
    for s in samples.iter_mut() {
        *s -= mean;
    }

    // Half-cosine ramp so the window ends do not masquerade as transients.
    let taper = ((sample_rate as usize) / 10).clamp(1, n / 4);
    for i in 0..taper {
        let w = 0.5 * (1.0 - (std::f32::consts::PI * i as f32 / taper as f32).cos());
        samples[i] *= w;
        samples[n - 1 - i] *= w;
    }
}

/// Find the validated global maximum of `values[lo..=hi]`.
///
/// The maximum only counts when it is an isolated peak: the signal must
/// drop below the range median on both sides of it, and the range must
/// cross the mid level between peak and median no more than
/// `MAX_MID_CROSSINGS` times on the way up.
pub(crate) fn peak_detector(
    values: &[f32],
    lo: usize,
    hi: usize,
    scratch: &mut Vec<f32>,
) -> Option<usize> {
    if lo > hi || hi >= values.len() {
        return None;
    }
    let range = &values[lo..=hi];
    if range.len() < 3 {
        return None;
    }

    let mut imax = 0;
    let mut vmax = range[0];
    for (i, &v) in range.iter().enumerate() {
        if v > vmax {
            vmax = v;
            imax = i;
        }
    }

    scratch.clear();
    scratch.extend_from_slice(range);
    let med = median(scratch);
    if vmax <= med {
        return None;
    }

    let descends_left = range[..imax].iter().any(|&v| v < med);
    let descends_right = range[imax + 1..].iter().any(|&v| v < med);
    if !descends_left || !descends_right {
        return None;
    }

    let mid = (vmax + med) / 2.0;
    let mut crossings = 0;
    let mut below = range[0] < mid;
    for &v in &range[1..] {
        if below && v >= mid {
            crossings += 1;
            below = false;
        } else if v < mid {
            below = true;
        }
    }
    if crossings > MAX_MID_CROSSINGS {
        return None;
    }

    Some(lo + imax)
}

fn local_peak(values: &[f32], center: usize, radius: usize) -> usize {
    let lo = center.saturating_sub(radius);
    let hi = (center + radius).min(values.len() - 1);
    let mut best = lo;
    for i in lo..=hi {
        if values[i] > values[best] {
            best = i;
        }
    }
    best
}

fn local_max_value(values: &[f32], center: usize, radius: usize) -> f32 {
    values[local_peak(values, center, radius)]
}

/// Estimate the beat period from an autocorrelation, in fractional samples,
/// together with the sample standard deviation of the per-cycle estimates.
pub(crate) fn estimate_period(
    autocorr: &[f32],
    sample_rate: u32,
    scratch: &mut Vec<f32>,
) -> AnalysisResult<(f64, f64)> {
    let n = autocorr.len();
    let lo = ((sample_rate / COARSE_DIVISOR) as usize).max(1);
    let hi = (sample_rate as usize).min(n.saturating_sub(1));
    if lo >= hi {
        return Err(AnalysisError::NoCandidatePeriod);
    }

    let coarse =
        peak_detector(autocorr, lo, hi, scratch).ok_or(AnalysisError::NoCandidatePeriod)?;
    let reference = autocorr[coarse];

    // The autocorrelation also peaks at every multiple of the fundamental,
    // so the global maximum may sit on a harmonic. Walk the divisors and
    // keep the smallest lag whose peak holds up against the original.
    let mut lag = coarse;
    for div in 2..=(coarse / lo).max(1) {
        let approx = coarse / div;
        if approx < lo {
            break;
        }
        let cand = local_peak(autocorr, approx, 4);
        if autocorr[cand] >= SUBHARMONIC_RATIO * reference {
            lag = cand;
        }
    }

    // A true beat period still correlates at one and a half times itself,
    // because tic also matches toc. If that correlation is missing, the
    // candidate is the bare tic-to-toc spacing and the period is twice it.
    let mut estimate = lag as f64;
    let idx = lag + lag / 2;
    let radius = (lag / 4).max(1);
    if idx + radius < n {
        let around = local_max_value(autocorr, idx, radius);
        if around < HALF_SPACING_RATIO * autocorr[lag] {
            let doubled = lag * 2;
            if (doubled as f64) < n as f64 / 2.0 {
                log::debug!(
                    "[Period] lag {} looks like a half spacing, doubling to {}",
                    lag,
                    doubled
                );
                estimate = doubled as f64;
            } else {
                return Err(AnalysisError::PeriodTooLong);
            }
        }
    }

    // Multi-cycle refinement: every reachable multiple of the estimate must
    // produce a consistent peak, and the far ones average into the final
    // period. A single bad cycle rejects the estimate outright.
    let tol = REFINE_TOLERANCE_RATIO * sample_rate as f64;
    let near_limit = n / 3;
    let far_limit = 2 * n / 3;
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut count = 0usize;
    let mut cycle = 1usize;
    loop {
        let center = estimate * cycle as f64;
        let lo_s = ((center - tol).floor().max(1.0)) as usize;
        let hi_s = (center + tol).ceil() as usize;
        if hi_s >= far_limit {
            break;
        }
        let peak = peak_detector(autocorr, lo_s, hi_s, scratch)
            .ok_or(AnalysisError::InvalidPeak { cycle })?;
        let normalized = peak as f64 / cycle as f64;
        if (normalized - estimate).abs() > tol / cycle as f64 {
            return Err(AnalysisError::InvalidPeak { cycle });
        }
        if peak >= near_limit {
            sum += normalized;
            sum_sq += normalized * normalized;
            count += 1;
        }
        cycle += 1;
    }

    let (period, sigma) = match count {
        // No cycle reached the far region: keep the raw estimate but report
        // a spread that can never lock.
        0 => (estimate, estimate),
        1 => (sum, sum),
        _ => {
            let mean = sum / count as f64;
            let var = (sum_sq - sum * sum / count as f64) / (count - 1) as f64;
            (mean, var.max(0.0).sqrt())
        }
    };
    Ok((period, sigma))
}
