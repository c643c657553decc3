// Fold a conditioned window onto one beat period.
//
// Every sample lands in the bin nearest its position modulo the period.
// Bins average with a trimmed mean so an outlier cycle (a knock, a skipped
// tick) cannot drag the folded shape, then the whole waveform is lowered by
// its median so the floor sits near zero.

use crate::dsp::stats::{median, trimmed_mean};

/// Fold `samples` onto `period` (fractional samples) into `folded`.
///
/// Returns the peak value and its bin. `bin_scratch` collects the samples
/// of one bin at a time, `base_scratch` the decimated baseline estimate;
/// both are reused across calls.
pub(crate) fn fold_waveform(
    samples: &[f32],
    period: f64,
    folded: &mut Vec<f32>,
    bin_scratch: &mut Vec<f32>,
    base_scratch: &mut Vec<f32>,
) -> (f32, usize) {
    let bins = period.ceil() as usize;
    folded.clear();
    if bins == 0 || samples.is_empty() {
        return (0.0, 0);
    }
    folded.reserve(bins);

    // Walking by whole periods from each bin index visits every sample of
    // that phase exactly once, without a divide per sample.
    for b in 0..bins {
        bin_scratch.clear();
        let mut pos = b as f64;
        loop {
            let idx = pos.round() as usize;
            if idx >= samples.len() {
                break;
            }
            bin_scratch.push(samples[idx]);
            pos += period;
        }
        folded.push(trimmed_mean(bin_scratch));
    }

    // Median of a decimated subsample is baseline enough.
    let step = (bins / 100).max(1);
    base_scratch.clear();
    let mut i = 0;
    while i < bins {
        base_scratch.push(folded[i]);
        i += step;
    }
    let base = median(base_scratch);

    let mut max = f32::MIN;
    let mut max_bin = 0;
    for (b, v) in folded.iter_mut().enumerate() {
        *v -= base;
        if *v > max {
            max = *v;
            max_bin = b;
        }
    }
    (max, max_bin)
}
