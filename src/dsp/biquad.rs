// Biquad - second-order IIR section in direct form II.
//
// Coefficients come from the bilinear transform of a Butterworth prototype
// (audio-EQ cookbook form). The two delay taps persist across `process`
// calls, so a filter fed consecutive chunks behaves identically to one fed
// the concatenated signal. Batch users reset between independent windows.

use std::f64::consts::{FRAC_1_SQRT_2, PI};

// Butterworth damping: maximally flat passband.
const Q: f64 = FRAC_1_SQRT_2;

/// Stateful second-order filter section.
#[derive(Debug, Clone)]
pub struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
    // Delay line of the direct-form-II recurrence.
    w1: f64,
    w2: f64,
}

impl Biquad {
    /// Low-pass section with the cutoff given as a fraction of the sample
    /// rate. The fraction is clamped into (0, 0.5) to stay below Nyquist.
    pub fn lowpass(cutoff_ratio: f64) -> Self {
        let (sin_w, cos_w) = omega(cutoff_ratio);
        let alpha = sin_w / (2.0 * Q);
        let b1 = 1.0 - cos_w;
        let b0 = b1 / 2.0;
        Self::from_normalized(b0, b1, b0, cos_w, alpha)
    }

    /// High-pass section with the cutoff given as a fraction of the sample
    /// rate.
    pub fn highpass(cutoff_ratio: f64) -> Self {
        let (sin_w, cos_w) = omega(cutoff_ratio);
        let alpha = sin_w / (2.0 * Q);
        let b0 = (1.0 + cos_w) / 2.0;
        let b1 = -(1.0 + cos_w);
        Self::from_normalized(b0, b1, b0, cos_w, alpha)
    }

    fn from_normalized(b0: f64, b1: f64, b2: f64, cos_w: f64, alpha: f64) -> Self {
        let a0 = 1.0 + alpha;
        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: -2.0 * cos_w / a0,
            a2: (1.0 - alpha) / a0,
            w1: 0.0,
            w2: 0.0,
        }
    }

    /// Clear the delay taps. Call between unrelated signals.
    pub fn reset(&mut self) {
        self.w1 = 0.0;
        self.w2 = 0.0;
    }

    /// Filter `samples` in place, carrying the delay taps across calls.
    pub fn process(&mut self, samples: &mut [f32]) {
        for sample in samples {
            let x = *sample as f64;
            let w = x - self.a1 * self.w1 - self.a2 * self.w2;
            let y = self.b0 * w + self.b1 * self.w1 + self.b2 * self.w2;
            self.w2 = self.w1;
            self.w1 = w;
            *sample = y as f32;
        }
    }
}

fn omega(cutoff_ratio: f64) -> (f64, f64) {
    let ratio = cutoff_ratio.clamp(1e-6, 0.499);
    let w = 2.0 * PI * ratio;
    (w.sin(), w.cos())
}
