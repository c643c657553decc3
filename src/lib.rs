// Tickscope Core - Mechanical Watch Timing Engine
// Multi-resolution acoustic rate, beat error and amplitude measurement

// Module declarations
pub mod analysis;
pub mod audio;
pub mod calibration;
pub mod config;
pub mod dsp;
pub mod engine;
pub mod error;

// Re-exports for convenience
pub use audio::{AudioSource, CaptureStream, SharedAudioRing};
pub use calibration::DriftEstimate;
pub use config::{AppConfig, EngineConfig, TimingParams};
pub use engine::{CalibrationStatus, Engine, Snapshot};
pub use error::{AnalysisError, CaptureError};
