// Correlator - FFT-domain auto- and cross-correlation.
//
// One instance owns forward and inverse plans of a single padded size plus
// the complex working buffers, so repeated windows of the same length never
// replan or reallocate. Signals are zero-padded to twice the window length,
// which keeps circular wrap-around out of the lag range the callers read.

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;

pub struct Correlator {
    /// Padded transform length, twice the window length.
    size: usize,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    signal_buf: Vec<Complex<f32>>,
    template_buf: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
}

impl Correlator {
    /// Build plans for signals up to `window_len` samples.
    pub fn new(window_len: usize) -> Self {
        let size = window_len.max(1) * 2;
        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(size);
        let inverse = planner.plan_fft_inverse(size);
        let scratch_len = forward
            .get_inplace_scratch_len()
            .max(inverse.get_inplace_scratch_len());
        Self {
            size,
            forward,
            inverse,
            signal_buf: vec![Complex::new(0.0, 0.0); size],
            template_buf: vec![Complex::new(0.0, 0.0); size],
            scratch: vec![Complex::new(0.0, 0.0); scratch_len],
        }
    }

    /// Padded transform length.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Autocorrelation of `signal` for lags `0..signal.len()`, written to
    /// `out`. Computed as IFFT(FFT(x) * conj(FFT(x))) over the padded
    /// length, normalized by the transform size.
    pub fn autocorrelation(&mut self, signal: &[f32], out: &mut Vec<f32>) {
        debug_assert!(signal.len() <= self.size / 2);
        load(&mut self.signal_buf, signal);

        self.forward
            .process_with_scratch(&mut self.signal_buf, &mut self.scratch);
        for bin in self.signal_buf.iter_mut() {
            *bin = Complex::new(bin.norm_sqr(), 0.0);
        }
        self.inverse
            .process_with_scratch(&mut self.signal_buf, &mut self.scratch);

        let scale = 1.0 / self.size as f32;
        out.clear();
        out.extend(self.signal_buf[..signal.len()].iter().map(|c| c.re * scale));
    }

    /// Cross-correlation of `signal` against `template`:
    /// `out[k] = sum_i signal[k + i] * template[i]`.
    ///
    /// Offsets `0..=signal.len() - template.len()` are linear correlations;
    /// beyond that the padded circular wrap bleeds in, so callers stay
    /// inside that range.
    pub fn cross_correlation(&mut self, signal: &[f32], template: &[f32], out: &mut Vec<f32>) {
        debug_assert!(signal.len() <= self.size / 2);
        debug_assert!(template.len() <= signal.len());
        load(&mut self.signal_buf, signal);
        load(&mut self.template_buf, template);

        self.forward
            .process_with_scratch(&mut self.signal_buf, &mut self.scratch);
        self.forward
            .process_with_scratch(&mut self.template_buf, &mut self.scratch);
        for (s, t) in self.signal_buf.iter_mut().zip(self.template_buf.iter()) {
            *s *= t.conj();
        }
        self.inverse
            .process_with_scratch(&mut self.signal_buf, &mut self.scratch);

        let scale = 1.0 / self.size as f32;
        out.clear();
        out.extend(self.signal_buf[..signal.len()].iter().map(|c| c.re * scale));
    }
}

fn load(buf: &mut [Complex<f32>], signal: &[f32]) {
    for (slot, &sample) in buf.iter_mut().zip(signal.iter()) {
        *slot = Complex::new(sample, 0.0);
    }
    for slot in buf.iter_mut().skip(signal.len()) {
        *slot = Complex::new(0.0, 0.0);
    }
}
