// Recovery of individual tick timestamps once a window holds a locked
// period, a folded waveform and beat positions.
//
// The folded waveform around a beat is that beat's matched filter. Slices
// of the window are cross-correlated against it, and correlation peaks
// near the predicted beat grid become events. Slices overlap by half so no
// tick ever straddles a seam.

use crate::analysis::period::peak_detector;
use crate::dsp::Correlator;

/// Locates tick events in a window. Owns the FFT plans and scratch for one
/// resolution step, so per-cycle calls do not allocate.
pub(crate) struct EventLocator {
    correlator: Correlator,
    slice_len: usize,
    template: Vec<f32>,
    corr: Vec<f32>,
    peak_scratch: Vec<f32>,
    positions: Vec<usize>,
}

impl EventLocator {
    pub(crate) fn new(window_len: usize) -> Self {
        let slice_len = (window_len / 2).max(2);
        Self {
            correlator: Correlator::new(slice_len),
            slice_len,
            template: Vec::new(),
            corr: Vec::new(),
            peak_scratch: Vec::new(),
            positions: Vec::new(),
        }
    }

    /// Find tick events across `samples` and append their absolute sample
    /// timestamps (`window_start` plus offset) to `out`, ascending.
    ///
    /// Nearby duplicates from overlapping slices collapse to the first
    /// detection; anything closer than half a spacing to its predecessor
    /// is the same tick seen twice.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn locate(
        &mut self,
        samples: &[f32],
        folded: &[f32],
        period: f64,
        spacing: f64,
        tic: f64,
        toc: f64,
        window_start: u64,
        out: &mut Vec<u64>,
    ) {
        let n = samples.len();
        let half = (period / 2.0).floor() as usize;
        if half < 4 || half >= self.slice_len || folded.is_empty() || n < self.slice_len {
            return;
        }
        let tol = (spacing / 8.0).max(2.0);
        let step = self.slice_len / 2;

        self.positions.clear();
        for &anchor in &[tic, toc] {
            self.build_template(folded, anchor, half);
            let mut slice_start = n - self.slice_len;
            loop {
                let slice = &samples[slice_start..slice_start + self.slice_len];
                self.correlator
                    .cross_correlation(slice, &self.template, &mut self.corr);
                self.collect_slice(anchor, period, tol, slice_start, half);
                if slice_start == 0 {
                    break;
                }
                slice_start = slice_start.saturating_sub(step);
            }
        }

        self.positions.sort_unstable();
        let min_gap = (spacing / 2.0) as usize;
        let mut last_kept: Option<usize> = None;
        for &p in &self.positions {
            if let Some(prev) = last_kept {
                if p - prev < min_gap {
                    continue;
                }
            }
            last_kept = Some(p);
            out.push(window_start + p as u64);
        }
    }

    /// Half a period of folded waveform, circular, centered on the beat
    /// and made zero-mean so correlation ignores the slice's DC.
    fn build_template(&mut self, folded: &[f32], anchor: f64, half: usize) {
        let bins = folded.len();
        let anchor_bin = (anchor.round() as usize).min(bins - 1);
        let start = (anchor_bin + bins - half / 2) % bins;
        self.template.clear();
        self.template.reserve(half);
        let mut sum = 0.0f64;
        for i in 0..half {
            let v = folded[(start + i) % bins];
            sum += v as f64;
            self.template.push(v);
        }
        let mean = (sum / half as f64) as f32;
        for v in self.template.iter_mut() {
            *v -= mean;
        }
    }

    /// Walk the beat grid of one anchor through one slice and keep every
    /// validated correlation peak near a predicted position.
    fn collect_slice(&mut self, anchor: f64, period: f64, tol: f64, slice_start: usize, half: usize) {
        // Template placements past this offset wrap circularly.
        let valid = self.slice_len - half;
        let mut m = 0usize;
        loop {
            let predicted = anchor - half as f64 / 2.0 + m as f64 * period;
            if predicted > (slice_start + valid) as f64 {
                break;
            }
            m += 1;
            let rel = predicted - slice_start as f64;
            if rel < 0.0 {
                continue;
            }
            let lo = (rel - tol).max(0.0) as usize;
            let hi = ((rel + tol) as usize).min(valid);
            if let Some(peak) =
                peak_detector(&self.corr[..=valid], lo, hi, &mut self.peak_scratch)
            {
                self.positions.push(slice_start + peak + half / 2);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::fold::fold_waveform;

    const PERIOD: f64 = 500.0;

    /// Tic pulses at phase 100, toc pulses at phase 350, 5 samples wide.
    fn two_beat_signal(len: usize) -> Vec<f32> {
        let mut signal = vec![0.0f32; len];
        let mut base = 0;
        while base + 355 < len {
            for d in 0..5 {
                signal[base + 100 + d] = 1.0;
                signal[base + 350 + d] = 0.7;
            }
            base += PERIOD as usize;
        }
        signal
    }

    fn fold(signal: &[f32]) -> Vec<f32> {
        let mut folded = Vec::new();
        fold_waveform(signal, PERIOD, &mut folded, &mut Vec::new(), &mut Vec::new());
        folded
    }

    #[test]
    fn test_events_land_on_the_beat_grid() {
        let signal = two_beat_signal(4000);
        let folded = fold(&signal);
        let mut locator = EventLocator::new(signal.len());
        let mut events = Vec::new();
        locator.locate(&signal, &folded, PERIOD, 250.0, 100.0, 350.0, 0, &mut events);

        assert!(
            events.len() >= 14,
            "most of the 16 beats should be recovered, got {}",
            events.len()
        );
        for &e in &events {
            let phase = e % 500;
            let near_tic = phase.abs_diff(100) <= 5;
            let near_toc = phase.abs_diff(350) <= 5;
            assert!(
                near_tic || near_toc,
                "event {} is off the beat grid (phase {})",
                e,
                phase
            );
        }
        for pair in events.windows(2) {
            assert!(pair[1] > pair[0], "events must be strictly ascending");
            assert!(pair[1] - pair[0] >= 125, "dedup gap violated: {:?}", pair);
        }
    }

    #[test]
    fn test_window_start_offsets_event_timestamps() {
        let signal = two_beat_signal(4000);
        let folded = fold(&signal);
        let mut locator = EventLocator::new(signal.len());

        let mut at_zero = Vec::new();
        locator.locate(&signal, &folded, PERIOD, 250.0, 100.0, 350.0, 0, &mut at_zero);
        let mut offset = Vec::new();
        locator.locate(
            &signal, &folded, PERIOD, 250.0, 100.0, 350.0, 44_100, &mut offset,
        );

        assert_eq!(at_zero.len(), offset.len());
        for (&a, &b) in at_zero.iter().zip(offset.iter()) {
            assert_eq!(b, a + 44_100);
        }
    }

    #[test]
    fn test_silent_window_yields_no_events() {
        let signal = vec![0.0f32; 4000];
        let folded = vec![0.0f32; 500];
        let mut locator = EventLocator::new(signal.len());
        let mut events = Vec::new();
        locator.locate(&signal, &folded, PERIOD, 250.0, 100.0, 350.0, 0, &mut events);
        assert!(events.is_empty());
    }

    #[test]
    fn test_degenerate_period_is_ignored() {
        let signal = two_beat_signal(4000);
        let folded = fold(&signal);
        let mut locator = EventLocator::new(signal.len());
        let mut events = Vec::new();
        // A period shorter than eight samples cannot carry a template.
        locator.locate(&signal, &folded, 6.0, 3.0, 1.0, 4.0, 0, &mut events);
        assert!(events.is_empty());
    }
}
