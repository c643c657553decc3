// Audio module - capture sources feeding the analysis engine
//
// Everything the engine knows about audio arrives through the AudioSource
// trait: windows of recent samples plus the running sample counter. The
// shared ring is the one implementation the engine needs; live capture and
// file playback both append into the same ring.

pub mod capture;
pub mod ring;

pub use capture::CaptureStream;
pub use ring::SharedAudioRing;

use crate::analysis::ProcessingBuffer;

/// Where the engine pulls samples from.
pub trait AudioSource: Send + Sync {
    /// Right-align the newest samples into every buffer and stamp each
    /// with the same end timestamp, so all resolution windows describe one
    /// consistent cut of the stream.
    fn fill_windows(&self, buffers: &mut [ProcessingBuffer]);

    /// Analysis samples appended so far.
    fn current_timestamp(&self) -> u64;
}
