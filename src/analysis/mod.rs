// Analysis module - per-window DSP pipeline for the timing engine
//
// One WindowAnalyzer per resolution step runs the full chain over that
// step's ProcessingBuffer each cycle:
//
//   suppress bursts -> condition -> autocorrelate -> period estimate
//   -> spacing and beat error -> fold -> envelope -> tic/toc
//   -> amplitude -> tick events
//
// Any failure up to the beat-error stage leaves the buffer not ready for
// this cycle. A missing amplitude is tolerated: the window still publishes
// with the amplitude reported as absent.

use tracing::debug;

use crate::config::TimingParams;
use crate::dsp::{Biquad, Correlator};
use crate::error::AnalysisResult;

pub mod buffer;
mod events;
mod extract;
mod fold;
mod period;

pub use buffer::{ProcessingBuffer, StepState, LOCK_SIGMA_RATIO};

use events::EventLocator;

/// Full analysis pipeline for one resolution step.
///
/// Owns the FFT plans, the conditioning filter and every scratch vector the
/// stages need, sized for this step's window. Buffers come in through
/// [`analyze`](WindowAnalyzer::analyze) and leave carrying results.
pub struct WindowAnalyzer {
    sample_rate: u32,
    correlator: Correlator,
    lowpass: Biquad,
    locator: EventLocator,

    // Scratch reused across cycles.
    peak_scratch: Vec<f32>,
    bin_scratch: Vec<f32>,
    base_scratch: Vec<f32>,
    block_scratch: Vec<f32>,
    energy_prefix: Vec<f64>,
    folded_ac: Vec<f32>,
    envelope: Vec<f32>,
    doubled: Vec<f32>,
    spacing_fold: Vec<f32>,
}

impl WindowAnalyzer {
    pub fn new(sample_rate: u32, window_len: usize) -> Self {
        Self {
            sample_rate,
            correlator: Correlator::new(window_len),
            lowpass: period::conditioning_filter(),
            locator: EventLocator::new(window_len),
            peak_scratch: Vec::new(),
            bin_scratch: Vec::new(),
            base_scratch: Vec::new(),
            block_scratch: Vec::new(),
            energy_prefix: Vec::new(),
            folded_ac: Vec::new(),
            envelope: Vec::new(),
            doubled: Vec::new(),
            spacing_fold: Vec::new(),
        }
    }

    /// Run the full pipeline on `buf`, replacing its previous results.
    pub fn analyze(&mut self, buf: &mut ProcessingBuffer, params: &TimingParams) -> AnalysisResult<()> {
        buf.clear_results();

        period::suppress_noise_bursts(
            &mut buf.samples,
            self.sample_rate,
            &mut self.energy_prefix,
            &mut self.block_scratch,
        );
        period::condition(&mut buf.samples, self.sample_rate, &mut self.lowpass);
        self.correlator.autocorrelation(&buf.samples, &mut buf.autocorr);

        let (period, sigma) =
            period::estimate_period(&buf.autocorr, self.sample_rate, &mut self.peak_scratch)?;
        buf.period = period;
        buf.sigma = sigma;

        let spacing = extract::find_spacing(
            &buf.autocorr,
            period,
            &mut self.folded_ac,
            &mut self.bin_scratch,
            &mut self.base_scratch,
            &mut self.peak_scratch,
        )?;
        buf.beat_error = extract::beat_error(period, spacing);

        let (folded_max, folded_max_bin) = fold::fold_waveform(
            &buf.samples,
            period,
            &mut buf.folded,
            &mut self.bin_scratch,
            &mut self.base_scratch,
        );
        buf.folded_max = folded_max;
        buf.folded_max_bin = folded_max_bin;

        let envelope_max =
            extract::leaky_envelope(&buf.folded, &mut self.doubled, &mut self.envelope);
        let (tic, toc) = extract::locate_tic_toc(
            &self.envelope,
            period,
            spacing,
            buf.window_start(),
            &mut buf.state,
            &mut self.spacing_fold,
        );
        buf.tic = tic;
        buf.toc = toc;

        match extract::amplitude(&self.envelope, period, tic, toc, params.lift_angle, envelope_max)
        {
            Ok((amplitude, tic_width, toc_width)) => {
                buf.amplitude = Some(amplitude);
                buf.tic_width = tic_width;
                buf.toc_width = toc_width;
            }
            Err(err) => {
                debug!(
                    "[Analysis] no amplitude on the {:.0}s window: {}",
                    buf.window_seconds(),
                    err
                );
            }
        }

        self.locator.locate(
            &buf.samples,
            &buf.folded,
            period,
            spacing,
            tic,
            toc,
            buf.window_start(),
            &mut buf.events,
        );

        buf.ready = true;
        Ok(())
    }

    /// Condition and fold `buf` at exactly one second per cycle.
    ///
    /// Used while a drift calibration runs against a once-per-second
    /// reference signal. The buffer is deliberately left not ready, so a
    /// calibration window never reaches the published snapshot.
    pub fn analyze_reference(&mut self, buf: &mut ProcessingBuffer) {
        buf.clear_results();
        period::condition(&mut buf.samples, self.sample_rate, &mut self.lowpass);
        buf.period = self.sample_rate as f64;
        buf.sigma = 0.0;
        let (folded_max, folded_max_bin) = fold::fold_waveform(
            &buf.samples,
            buf.period,
            &mut buf.folded,
            &mut self.bin_scratch,
            &mut self.base_scratch,
        );
        buf.folded_max = folded_max;
        buf.folded_max_bin = folded_max_bin;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimingParams;

    const RATE: u32 = 12_000;
    const WINDOW: usize = 24_000;
    const PERIOD: usize = 4_000;

    /// A watch beating every 2000 samples with a 100-sample beat error:
    /// tic bursts at phase 1200, toc bursts at phase 3100, so the spacing
    /// is 1900 instead of a clean half period.
    fn watch_signal(burst: usize) -> ProcessingBuffer {
        let mut buf = ProcessingBuffer::new(RATE, WINDOW);
        let mut base = 0;
        while base + 3100 + burst < WINDOW {
            for d in 0..burst {
                buf.samples[base + 1200 + d] = 1.0;
                buf.samples[base + 3100 + d] = 0.8;
            }
            base += PERIOD;
        }
        buf.end_timestamp = WINDOW as u64;
        buf
    }

    #[test]
    fn test_full_pipeline_on_synthetic_watch() {
        let mut analyzer = WindowAnalyzer::new(RATE, WINDOW);
        let mut buf = watch_signal(123);
        analyzer
            .analyze(&mut buf, &TimingParams::default())
            .expect("synthetic watch should analyze");

        assert!(buf.ready);
        assert!(
            (buf.period - PERIOD as f64).abs() < 5.0,
            "period should come out near 4000, got {}",
            buf.period
        );
        assert!(buf.is_locked(), "clean signal should lock, sigma {}", buf.sigma);
        assert!(
            (buf.beat_error - 100.0).abs() <= 3.0,
            "beat error should be about 100 samples, got {}",
            buf.beat_error
        );

        let spread = (buf.toc - buf.tic).rem_euclid(buf.period);
        assert!(
            (spread - 1900.0).abs() < 3.0 || (spread - 2100.0).abs() < 3.0,
            "tic and toc should sit one spacing apart, got {}",
            spread
        );

        let amp = buf.amplitude.expect("clean bursts should measure");
        assert!(
            (135.0..360.0).contains(&amp),
            "amplitude must be plausible, got {}",
            amp
        );

        assert!(
            buf.events.len() >= 10,
            "most of the 12 beats should produce events, got {}",
            buf.events.len()
        );
        for pair in buf.events.windows(2) {
            assert!(pair[1] > pair[0]);
        }
    }

    #[test]
    fn test_washy_signal_locks_without_amplitude() {
        // 300-sample smears: every threshold yields a pulse too wide for a
        // plausible amplitude, but timing results still publish.
        let mut analyzer = WindowAnalyzer::new(RATE, WINDOW);
        let mut buf = watch_signal(300);
        analyzer
            .analyze(&mut buf, &TimingParams::default())
            .expect("washy watch should still analyze");

        assert!(buf.ready);
        assert!((buf.period - PERIOD as f64).abs() < 5.0);
        assert!(buf.amplitude.is_none(), "washy pulses must not fake an amplitude");
    }

    #[test]
    fn test_silence_fails_before_publishing() {
        let mut analyzer = WindowAnalyzer::new(RATE, WINDOW);
        let mut buf = ProcessingBuffer::new(RATE, WINDOW);
        buf.end_timestamp = WINDOW as u64;

        let result = analyzer.analyze(&mut buf, &TimingParams::default());
        assert!(result.is_err(), "silence must not produce a period");
        assert!(!buf.ready);
        assert!(!buf.is_locked());
    }

    #[test]
    fn test_reference_fold_stacks_one_second_pulses() {
        let mut analyzer = WindowAnalyzer::new(RATE, WINDOW);
        let mut buf = ProcessingBuffer::new(RATE, WINDOW);
        // A one-second reference pip, slightly late each second.
        for k in 0..2 {
            let at = 3_000 + k * RATE as usize;
            for d in 0..30 {
                buf.samples[at + d] = 1.0;
            }
        }
        analyzer.analyze_reference(&mut buf);

        assert!(!buf.ready, "calibration windows never publish");
        assert_eq!(buf.period, RATE as f64);
        assert_eq!(buf.folded.len(), RATE as usize);
        assert!(
            buf.folded_max_bin.abs_diff(3_000) < 60,
            "fold peak should sit at the pip phase, got bin {}",
            buf.folded_max_bin
        );
    }
}
