// Error types for the analysis pipeline and the capture boundary.
//
// Analysis errors are ordinary values: a failed stage abandons its own
// window's computation for this cycle and the orchestrator falls back to a
// coarser resolution or the previous snapshot. Nothing here aborts the
// process.

use thiserror::Error;

/// Non-fatal failures of a single analysis window.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AnalysisError {
    /// The coarse autocorrelation search produced no validated peak.
    #[error("no candidate period in the correlation search range")]
    NoCandidatePeriod,

    /// A refinement cycle's correlation peak was missing or drifted out of
    /// tolerance, invalidating the whole estimate.
    #[error("correlation peak failed validation at cycle {cycle}")]
    InvalidPeak { cycle: usize },

    /// Doubling the tic-to-toc spacing would push the period past half the
    /// window, where it cannot be confirmed.
    #[error("doubled period exceeds half the analysis window")]
    PeriodTooLong,

    /// The folded autocorrelation has no peak near the half period, so the
    /// tic-to-toc spacing is unknown.
    #[error("no tic/toc spacing peak near the half period")]
    BeatErrorNotFound,

    /// No threshold produced pulse widths with plausible, mutually
    /// consistent amplitudes.
    #[error("pulse widths never yielded a plausible amplitude")]
    AmplitudeUnavailable,

    /// The folded reference waveform has no rising edge near its maximum.
    #[error("no rising edge near the reference maximum")]
    CalibrationEdgeNotFound,

    /// Calibration finished collecting but the regression is too noisy to
    /// trust.
    #[error("calibration confidence {confidence:.3} s/day exceeds the {limit} s/day limit")]
    CalibrationLowConfidence { confidence: f64, limit: f64 },
}

/// Failures opening or running the audio input device. Reported once at the
/// capture boundary; the analysis core never sees these.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no default input device available")]
    NoDevice,

    #[error("failed to query the input configuration: {0}")]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),

    #[error("failed to build the input stream: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),

    #[error("failed to start the input stream: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),

    #[error("unsupported input sample format {0:?}")]
    UnsupportedFormat(cpal::SampleFormat),
}

pub type AnalysisResult<T> = Result<T, AnalysisError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analysis_error_messages_are_stable() {
        assert_eq!(
            AnalysisError::InvalidPeak { cycle: 3 }.to_string(),
            "correlation peak failed validation at cycle 3"
        );
        assert_eq!(
            AnalysisError::NoCandidatePeriod.to_string(),
            "no candidate period in the correlation search range"
        );
    }

    #[test]
    fn test_low_confidence_carries_values() {
        let err = AnalysisError::CalibrationLowConfidence {
            confidence: 0.25,
            limit: 0.1,
        };
        assert!(err.to_string().contains("0.250"));
        assert!(err.to_string().contains("0.1"));
    }
}
