// DSP primitives shared by the analysis pipeline.

pub mod biquad;
pub mod fft;
pub mod stats;

pub use biquad::Biquad;
pub use fft::Correlator;
