// Extraction of the per-beat figures from a folded waveform: tic and toc
// position, beat error and balance amplitude.
//
// All positions are fractional sample offsets into one period. Tic and toc
// are labels, not physical claims: the first locked window picks one, and
// phase continuity keeps the labels stable from window to window.

use crate::analysis::buffer::StepState;
use crate::analysis::fold::fold_waveform;
use crate::analysis::period::peak_detector;
use crate::error::{AnalysisError, AnalysisResult};

/// Leaky envelope memory: weights fall to exp(-50) over one full period,
/// which smears each tick into a hump around a fiftieth of a period wide.
const ENVELOPE_DECAY_EXPONENT: f64 = 50.0;
/// Pulse-width thresholds start here, as a fraction of the envelope peak.
const WIDTH_THRESHOLD_FLOOR: f64 = 0.05;
/// Threshold growth per attempt while the measured amplitude stays
/// implausible.
const WIDTH_THRESHOLD_GROWTH: f64 = 1.4;
/// A running mechanical watch swings at least this many degrees.
const MIN_AMPLITUDE_DEGREES: f64 = 135.0;
/// An amplitude at or past a full turn means the escapement would knock.
const MAX_AMPLITUDE_DEGREES: f64 = 360.0;
/// Tic and toc amplitude may differ by at most this many degrees before
/// the measurement is considered unreliable.
const MAX_BEAT_DISAGREEMENT_DEGREES: f64 = 60.0;

/// Locate the tic-to-toc spacing by folding the autocorrelation onto the
/// period and peak-searching near its middle.
///
/// The folded autocorrelation peaks at lag zero and at the spacing (and its
/// mirror); a healthy escapement keeps both inside the middle quarter.
pub(crate) fn find_spacing(
    autocorr: &[f32],
    period: f64,
    folded_ac: &mut Vec<f32>,
    bin_scratch: &mut Vec<f32>,
    base_scratch: &mut Vec<f32>,
    peak_scratch: &mut Vec<f32>,
) -> AnalysisResult<f64> {
    fold_waveform(autocorr, period, folded_ac, bin_scratch, base_scratch);
    let bins = folded_ac.len();
    if bins < 8 {
        return Err(AnalysisError::BeatErrorNotFound);
    }
    let lo = bins / 2 - bins / 8;
    let hi = (bins / 2 + bins / 8).min(bins - 1);
    let at = peak_detector(folded_ac, lo, hi, peak_scratch)
        .ok_or(AnalysisError::BeatErrorNotFound)?;
    Ok(at as f64)
}

/// Beat error in samples: how far the spacing sits from a perfect half
/// period.
pub(crate) fn beat_error(period: f64, spacing: f64) -> f64 {
    (spacing - period / 2.0).abs()
}

/// Peak-hold envelope of the folded waveform, circular via a doubled copy.
///
/// Forward and backward leaky passes are combined with a max, so each tick
/// becomes a symmetric hump wide enough to measure. Returns the envelope
/// peak.
pub(crate) fn leaky_envelope(
    folded: &[f32],
    doubled: &mut Vec<f32>,
    envelope: &mut Vec<f32>,
) -> f32 {
    let n = folded.len();
    envelope.clear();
    if n == 0 {
        return 0.0;
    }
    let decay = (-ENVELOPE_DECAY_EXPONENT / n as f64).exp() as f32;

    doubled.clear();
    doubled.extend_from_slice(folded);
    doubled.extend_from_slice(folded);
    let mut acc = 0.0f32;
    for v in doubled.iter_mut() {
        acc = v.max(acc * decay);
        *v = acc;
    }
    // The second half has seen a full period of history, so it wraps.
    envelope.extend_from_slice(&doubled[n..]);

    doubled.clear();
    doubled.extend_from_slice(folded);
    doubled.extend_from_slice(folded);
    acc = 0.0;
    for v in doubled.iter_mut().rev() {
        acc = v.max(acc * decay);
        *v = acc;
    }
    let mut max = 0.0f32;
    for (e, &b) in envelope.iter_mut().zip(doubled[..n].iter()) {
        if b > *e {
            *e = b;
        }
        if *e > max {
            max = *e;
        }
    }
    max
}

/// Locate tic and toc inside the period and keep their labels consistent
/// with the previous window of this resolution step.
///
/// Folding the envelope by the spacing stacks tic onto toc; the strongest
/// fold bin is the common beat phase. The two beats are then that phase and
/// the phase one spacing later. Label stability comes from comparing the
/// new tic against the remembered absolute tic position modulo the period.
pub(crate) fn locate_tic_toc(
    envelope: &[f32],
    period: f64,
    spacing: f64,
    window_start: u64,
    state: &mut StepState,
    fold_scratch: &mut Vec<f32>,
) -> (f64, f64) {
    let bins = spacing.ceil() as usize;
    fold_scratch.clear();
    for b in 0..bins {
        let mut sum = 0.0f32;
        let mut count = 0u32;
        let mut pos = b as f64;
        loop {
            let idx = pos.round() as usize;
            if idx >= envelope.len() {
                break;
            }
            sum += envelope[idx];
            count += 1;
            pos += spacing;
        }
        fold_scratch.push(if count > 0 { sum / count as f32 } else { 0.0 });
    }

    let mut best = 0;
    for (i, &v) in fold_scratch.iter().enumerate() {
        if v > fold_scratch[best] {
            best = i;
        }
    }
    let mut tic = best as f64;
    let mut toc = tic + spacing;
    if toc >= period {
        toc -= period;
    }

    if let Some(last) = state.last_tic {
        let mut drift = (window_start as f64 + tic - last).rem_euclid(period);
        if drift >= period / 2.0 {
            drift -= period;
        }
        if drift.abs() > period / 4.0 {
            std::mem::swap(&mut tic, &mut toc);
        }
    }
    state.last_tic = Some(window_start as f64 + tic);
    state.last_toc = Some(window_start as f64 + toc);
    (tic, toc)
}

/// Width of the envelope hump around `anchor` at `threshold`, in samples.
///
/// The search is circular and limited to an eighth of a period either side,
/// so neighboring beats stay out of the measurement.
fn pulse_width(envelope: &[f32], anchor: usize, threshold: f32) -> Option<f64> {
    let n = envelope.len();
    let reach = n / 8;
    let mut first = None;
    let mut last = None;
    for k in 0..=2 * reach {
        let idx = (anchor + n - reach + k) % n;
        if envelope[idx] >= threshold {
            if first.is_none() {
                first = Some(k);
            }
            last = Some(k);
        }
    }
    let width = (last? - first?) as f64;
    if width < 1.0 {
        None
    } else {
        Some(width)
    }
}

/// Balance amplitude in degrees from the envelope pulse widths at tic and
/// toc.
///
/// The escapement engages while the balance sweeps the lift angle around
/// mid-swing, so width and amplitude relate through the swing's sinusoidal
/// motion. The threshold walks upward until both beats land in a plausible
/// band and agree with each other; ring-down tails below the final
/// threshold never enter the width.
pub(crate) fn amplitude(
    envelope: &[f32],
    period: f64,
    tic: f64,
    toc: f64,
    lift_angle: f64,
    envelope_max: f32,
) -> AnalysisResult<(f64, f64, f64)> {
    if envelope_max <= 0.0 || envelope.is_empty() {
        return Err(AnalysisError::AmplitudeUnavailable);
    }
    let n = envelope.len();
    let tic_bin = (tic.round() as usize).min(n - 1);
    let toc_bin = (toc.round() as usize).min(n - 1);

    let degrees = |width: f64| lift_angle / (2.0 * (std::f64::consts::PI * width / period).sin());

    let mut threshold = WIDTH_THRESHOLD_FLOOR * envelope_max as f64;
    while threshold < envelope_max as f64 {
        let widths = (
            pulse_width(envelope, tic_bin, threshold as f32),
            pulse_width(envelope, toc_bin, threshold as f32),
        );
        if let (Some(tic_width), Some(toc_width)) = widths {
            let tic_amp = degrees(tic_width);
            let toc_amp = degrees(toc_width);
            let plausible = |a: f64| (MIN_AMPLITUDE_DEGREES..MAX_AMPLITUDE_DEGREES).contains(&a);
            if plausible(tic_amp)
                && plausible(toc_amp)
                && (tic_amp - toc_amp).abs() < MAX_BEAT_DISAGREEMENT_DEGREES
            {
                return Ok(((tic_amp + toc_amp) / 2.0, tic_width, toc_width));
            }
        }
        threshold *= WIDTH_THRESHOLD_GROWTH;
    }
    Err(AnalysisError::AmplitudeUnavailable)
}
