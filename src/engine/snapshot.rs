// Snapshot - one immutable set of published results
//
// The worker builds a fresh Snapshot each cycle from whichever resolution
// window locked; consumers hold an Arc to it for as long as they like.
// Serialization is the wire format: the CLI prints these as JSON lines.

use serde::Serialize;

use crate::analysis::ProcessingBuffer;
use crate::config::TimingParams;

/// Beat rates, in beats per hour, of common production movements.
const STANDARD_BPH: [f64; 10] = [
    12_000.0, 14_400.0, 18_000.0, 19_800.0, 21_600.0, 25_200.0, 28_800.0, 36_000.0, 43_200.0,
    72_000.0,
];
/// A measured rate within this fraction of a standard one snaps to it.
const BPH_SNAP_RATIO: f64 = 0.03;

/// Everything one analysis cycle learned, frozen for consumers.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    /// Analysis sample rate in Hz.
    pub sample_rate: u32,
    /// Length of the window behind these results, in samples.
    pub window_len: usize,
    /// Absolute sample count at the end of that window.
    pub end_timestamp: u64,
    /// Beat period in fractional samples (one tic plus one toc).
    pub period: f64,
    /// Spread of the per-cycle period estimates, in samples.
    pub sigma: f64,
    /// Beat error in samples.
    pub beat_error: f64,
    /// Tic offset within the folded waveform, in samples.
    pub tic: f64,
    /// Toc offset within the folded waveform, in samples.
    pub toc: f64,
    /// Tic pulse width in samples.
    pub tic_width: f64,
    /// Toc pulse width in samples.
    pub toc_width: f64,
    /// Balance amplitude in degrees, when it could be measured.
    pub amplitude: Option<f64>,
    /// Beats per hour: the user's override, or the measured rate snapped
    /// to the nearest standard movement.
    pub guessed_bph: f64,
    /// Daily rate in seconds per day; positive runs fast.
    pub day_rate: f64,
    /// The folded waveform, one period long.
    pub waveform: Vec<f32>,
    /// Newest recovered tick timestamps, ascending, bounded in length.
    pub events: Vec<u64>,
    /// True when no window locked this cycle and these are the previous
    /// results republished.
    pub is_old: bool,
    /// Parameters the cycle ran with.
    pub params: TimingParams,
}

/// Measured beats per hour for a period in samples.
pub fn measured_bph(period: f64, sample_rate: u32) -> f64 {
    if period <= 0.0 {
        return 0.0;
    }
    7_200.0 * sample_rate as f64 / period
}

/// Snap a measured rate to the nearest standard movement rate, or round it
/// to a whole number when nothing standard is close.
pub fn guess_bph(measured: f64) -> f64 {
    for &standard in STANDARD_BPH.iter() {
        if (measured - standard).abs() <= BPH_SNAP_RATIO * standard {
            return standard;
        }
    }
    measured.round()
}

/// Daily rate in seconds per day for a measured period against a nominal
/// rate, with the capture clock drift folded in.
///
/// `calibration` is the capture clock's own error in seconds per day, as
/// measured by the drift calibration; it corrects the effective sample
/// rate before the watch is judged.
pub fn day_rate(period: f64, sample_rate: u32, bph: f64, calibration: f64) -> f64 {
    if period <= 0.0 || bph <= 0.0 {
        return 0.0;
    }
    let effective_rate = sample_rate as f64 * (1.0 + calibration / 86_400.0);
    let nominal_period = 7_200.0 / bph;
    86_400.0 * (nominal_period * effective_rate / period - 1.0)
}

impl Snapshot {
    /// Freeze the results of `buf` under `params`.
    pub fn from_buffer(buf: &ProcessingBuffer, params: &TimingParams, event_capacity: usize) -> Self {
        let bph = if params.bph > 0.0 {
            params.bph
        } else {
            guess_bph(measured_bph(buf.period, buf.sample_rate))
        };

        let skip = buf.events.len().saturating_sub(event_capacity);
        Self {
            sample_rate: buf.sample_rate,
            window_len: buf.window_len,
            end_timestamp: buf.end_timestamp,
            period: buf.period,
            sigma: buf.sigma,
            beat_error: buf.beat_error,
            tic: buf.tic,
            toc: buf.toc,
            tic_width: buf.tic_width,
            toc_width: buf.toc_width,
            amplitude: buf.amplitude,
            guessed_bph: bph,
            day_rate: day_rate(buf.period, buf.sample_rate, bph, params.calibration),
            waveform: buf.folded.clone(),
            events: buf.events[skip..].to_vec(),
            is_old: false,
            params: *params,
        }
    }

    /// Beat error in milliseconds, for display.
    pub fn beat_error_ms(&self) -> f64 {
        1_000.0 * self.beat_error / self.sample_rate as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guess_snaps_within_three_percent() {
        assert_eq!(guess_bph(21_600.0), 21_600.0);
        assert_eq!(guess_bph(21_600.0 * 1.02), 21_600.0);
        assert_eq!(guess_bph(28_800.0 * 0.98), 28_800.0);
        // 16000 sits between 14400 (+11%) and 18000 (-11%).
        assert_eq!(guess_bph(16_000.4), 16_000.0);
    }

    #[test]
    fn test_day_rate_sign_follows_the_watch() {
        let rate = 44_100;
        // 21600 bph: a nominal period is a third of a second.
        let nominal = 7_200.0 / 21_600.0 * rate as f64;
        assert!(day_rate(nominal, rate, 21_600.0, 0.0).abs() < 1e-9);

        // A short period means the watch beats fast: positive rate.
        let fast = day_rate(nominal * 0.9999, rate, 21_600.0, 0.0);
        assert!(fast > 8.0 && fast < 9.0, "0.01% fast is 8.64 s/day, got {}", fast);

        let slow = day_rate(nominal * 1.0001, rate, 21_600.0, 0.0);
        assert!(slow < -8.0 && slow > -9.0, "got {}", slow);
    }

    #[test]
    fn test_calibration_cancels_capture_drift() {
        let rate = 44_100;
        // The capture clock runs 5 s/day fast, so a perfect watch appears
        // to beat 5 s/day fast as well; the calibration term removes it.
        let drift = 5.0;
        let apparent_period = 7_200.0 / 21_600.0 * rate as f64 * (1.0 + drift / 86_400.0);
        let corrected = day_rate(apparent_period, rate, 21_600.0, drift);
        assert!(
            corrected.abs() < 1e-6,
            "calibrated rate should cancel, got {}",
            corrected
        );
        let uncorrected = day_rate(apparent_period, rate, 21_600.0, 0.0);
        assert!((uncorrected + drift).abs() < 0.001, "got {}", uncorrected);
    }

    #[test]
    fn test_snapshot_honors_bph_override_and_event_cap() {
        let mut buf = ProcessingBuffer::new(44_100, 88_200);
        buf.period = 14_700.0;
        buf.events = (0..300u64).map(|i| i * 7_350).collect();

        let auto = Snapshot::from_buffer(&buf, &TimingParams::default(), 128);
        assert_eq!(auto.guessed_bph, 21_600.0);
        assert_eq!(auto.events.len(), 128);
        assert_eq!(*auto.events.first().unwrap(), (300 - 128) * 7_350);
        assert!(!auto.is_old);

        let params = TimingParams {
            bph: 18_000.0,
            ..TimingParams::default()
        };
        let fixed = Snapshot::from_buffer(&buf, &params, 128);
        assert_eq!(fixed.guessed_bph, 18_000.0);
        // Judged against 18000 bph, a 21600 bph beat runs wildly fast.
        assert!(fixed.day_rate > 10_000.0);
    }
}
