// ProcessingBuffer - one resolution step's working storage and results.
//
// Every buffer is allocated once at startup and overwritten each analysis
// cycle; nothing here allocates on the hot path.

/// A period estimate counts as locked once its spread collapses below this
/// fraction of the period itself.
pub const LOCK_SIGMA_RATIO: f64 = 1e-4;

/// Cross-cycle tic/toc phase history for one resolution step.
///
/// Survives the per-cycle result reset so the labeling of tic versus toc
/// stays continuous from one window to the next.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepState {
    /// Absolute sample time of the last labeled tic, fractional.
    pub last_tic: Option<f64>,
    /// Absolute sample time of the last labeled toc, fractional.
    pub last_toc: Option<f64>,
}

/// Working storage and per-cycle results for one resolution window.
#[derive(Debug)]
pub struct ProcessingBuffer {
    /// Analysis sample rate in Hz.
    pub sample_rate: u32,
    /// Window length in samples.
    pub window_len: usize,
    /// Samples of the current window, oldest first.
    pub samples: Vec<f32>,
    /// Autocorrelation for lags `0..window_len`.
    pub autocorr: Vec<f32>,
    /// Folded waveform, `ceil(period)` bins once folded.
    pub folded: Vec<f32>,
    /// Peak value of the folded waveform after baseline correction.
    pub folded_max: f32,
    /// Bin index of the folded peak.
    pub folded_max_bin: usize,
    /// Recovered tick-event timestamps, absolute samples, chronological.
    pub events: Vec<u64>,

    /// Absolute sample count at the end of the current window.
    pub end_timestamp: u64,
    /// True once the full pipeline produced results for this cycle.
    pub ready: bool,

    /// Beat period in fractional samples; covers one tic plus one toc.
    pub period: f64,
    /// Sample standard deviation of the per-cycle period estimates.
    pub sigma: f64,
    /// Beat error in samples: how far the tic-to-toc spacing sits from a
    /// perfect half period.
    pub beat_error: f64,
    /// Tic offset within the folded waveform.
    pub tic: f64,
    /// Toc offset within the folded waveform.
    pub toc: f64,
    /// Tic pulse width in samples.
    pub tic_width: f64,
    /// Toc pulse width in samples.
    pub toc_width: f64,
    /// Balance amplitude in degrees, when measurable.
    pub amplitude: Option<f64>,

    /// Phase history carried across cycles.
    pub state: StepState,
}

impl ProcessingBuffer {
    pub fn new(sample_rate: u32, window_len: usize) -> Self {
        Self {
            sample_rate,
            window_len,
            samples: vec![0.0; window_len],
            autocorr: Vec::with_capacity(window_len),
            folded: Vec::new(),
            folded_max: 0.0,
            folded_max_bin: 0,
            events: Vec::new(),
            end_timestamp: 0,
            ready: false,
            period: 0.0,
            sigma: 0.0,
            beat_error: 0.0,
            tic: 0.0,
            toc: 0.0,
            tic_width: 0.0,
            toc_width: 0.0,
            amplitude: None,
            state: StepState::default(),
        }
    }

    /// Window length in seconds, for logs.
    pub fn window_seconds(&self) -> f64 {
        self.window_len as f64 / self.sample_rate as f64
    }

    /// Absolute sample index of the first window sample.
    pub fn window_start(&self) -> u64 {
        self.end_timestamp.saturating_sub(self.window_len as u64)
    }

    /// Whether this window's estimate is stable enough to publish.
    pub fn is_locked(&self) -> bool {
        self.ready && self.period > 0.0 && self.sigma / self.period < LOCK_SIGMA_RATIO
    }

    /// Reset the per-cycle outputs. The sample storage and the cross-cycle
    /// phase history are left alone.
    pub fn clear_results(&mut self) {
        self.ready = false;
        self.period = 0.0;
        self.sigma = 0.0;
        self.beat_error = 0.0;
        self.tic = 0.0;
        self.toc = 0.0;
        self.tic_width = 0.0;
        self.toc_width = 0.0;
        self.amplitude = None;
        self.folded_max = 0.0;
        self.folded_max_bin = 0;
        self.events.clear();
    }
}
