// SharedAudioRing - the capture-to-analysis handoff
//
// One fixed ring of recent analysis-rate samples behind a mutex. Writers
// append in small chunks; the analysis thread copies every resolution
// window out under a single lock, so all windows end at the same instant.
// Optional decimation averages groups of raw samples down to the analysis
// rate on the way in.

use std::sync::{Mutex, MutexGuard};

use crate::analysis::ProcessingBuffer;
use crate::audio::AudioSource;

pub struct SharedAudioRing {
    inner: Mutex<RingInner>,
    decimation: u32,
}

struct RingInner {
    data: Vec<f32>,
    write_pos: usize,
    /// Analysis samples appended since construction.
    timestamp: u64,
    /// Partial decimation group.
    acc: f32,
    acc_len: u32,
}

impl SharedAudioRing {
    /// `capacity` is in analysis samples and must cover the largest
    /// window. Every `decimation` raw samples average into one analysis
    /// sample.
    pub fn new(capacity: usize, decimation: u32) -> Self {
        Self {
            inner: Mutex::new(RingInner {
                data: vec![0.0; capacity.max(1)],
                write_pos: 0,
                timestamp: 0,
                acc: 0.0,
                acc_len: 0,
            }),
            decimation: decimation.max(1),
        }
    }

    /// Append raw samples, averaging each decimation group into the ring.
    pub fn append(&self, samples: &[f32]) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let capacity = inner.data.len();
        for &s in samples {
            inner.acc += s;
            inner.acc_len += 1;
            if inner.acc_len == self.decimation {
                let at = inner.write_pos;
                inner.data[at] = inner.acc / self.decimation as f32;
                inner.write_pos = (at + 1) % capacity;
                inner.timestamp += 1;
                inner.acc = 0.0;
                inner.acc_len = 0;
            }
        }
    }

    // A poisoned lock only means a panic elsewhere; the ring state itself
    // is always valid, so recover the guard.
    fn lock(&self) -> MutexGuard<'_, RingInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl AudioSource for SharedAudioRing {
    fn fill_windows(&self, buffers: &mut [ProcessingBuffer]) {
        let inner = self.lock();
        let capacity = inner.data.len();
        for buf in buffers.iter_mut() {
            let n = buf.window_len;
            debug_assert!(n <= capacity, "window does not fit the ring");
            let avail = n.min(inner.timestamp.min(capacity as u64) as usize);
            let lead = n - avail;
            buf.samples[..lead].fill(0.0);

            let start = (inner.write_pos + capacity - avail) % capacity;
            let first = (capacity - start).min(avail);
            buf.samples[lead..lead + first]
                .copy_from_slice(&inner.data[start..start + first]);
            buf.samples[lead + first..].copy_from_slice(&inner.data[..avail - first]);
            buf.end_timestamp = inner.timestamp;
        }
    }

    fn current_timestamp(&self) -> u64 {
        self.lock().timestamp
    }
}
