// CaptureStream - cpal microphone capture into the shared ring
//
// The cpal callback must stay allocation-free and lock-free, so samples
// hop through an rtrb ring to a feeder thread, and the feeder alone talks
// to the mutex-guarded analysis ring.
//
// Devices report their own rates; the capture picks an integer decimation
// that brings the device rate down to (or near) the requested analysis
// rate, and the caller reads back the effective rate actually in use.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use crate::audio::SharedAudioRing;
use crate::error::CaptureError;

/// How many raw samples the callback-to-feeder ring holds. One second at
/// 192 kHz covers every device cpal will reasonably hand us.
const QUEUE_SAMPLES: usize = 192_000;
/// Feeder batch size; small enough to keep ring latency low.
const FEED_CHUNK: usize = 4_096;

pub struct CaptureStream {
    stream: Option<cpal::Stream>,
    feeder: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    analysis_rate: u32,
}

impl CaptureStream {
    /// Open the default input device and start feeding a new ring.
    ///
    /// `target_rate` is the analysis rate the caller would like;
    /// `history_seconds` how much audio the ring must retain, which is
    /// the largest analysis window. Returns the running capture plus the
    /// ring the engine should read from. The effective analysis rate is
    /// the device rate divided by the chosen decimation and may differ
    /// from `target_rate`; hand [`analysis_rate`](Self::analysis_rate)
    /// to the engine config.
    pub fn start(
        target_rate: u32,
        history_seconds: u32,
    ) -> Result<(Self, Arc<SharedAudioRing>), CaptureError> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or(CaptureError::NoDevice)?;
        let config = device.default_input_config()?;

        let stream_config: cpal::StreamConfig = config.clone().into();
        let channel_count = (stream_config.channels as usize).max(1);
        let device_rate = stream_config.sample_rate.0;
        let decimation = (device_rate / target_rate.max(1)).max(1);
        let analysis_rate = device_rate / decimation;

        log::info!(
            "[Capture] device '{}' at {} Hz, {} channels, decimating by {} to {} Hz",
            device.name().unwrap_or_else(|_| "unknown".to_string()),
            device_rate,
            channel_count,
            decimation,
            analysis_rate
        );

        // Sized after decimation is known, so a device running at an
        // unexpected rate still retains full windows.
        let capacity = (history_seconds as usize).max(1) * analysis_rate as usize;
        let ring = Arc::new(SharedAudioRing::new(capacity, decimation));
        let (mut producer, mut consumer) = rtrb::RingBuffer::<f32>::new(QUEUE_SAMPLES);

        let err_fn = |err| log::error!("[Capture] input stream error: {}", err);
        let stream = match config.sample_format() {
            cpal::SampleFormat::F32 => device.build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    // De-interleave: take first channel. On overflow drop
                    // the tail; the feeder is behind anyway.
                    for frame in data.chunks(channel_count) {
                        if producer.push(frame[0]).is_err() {
                            break;
                        }
                    }
                },
                err_fn,
                None,
            )?,
            format => return Err(CaptureError::UnsupportedFormat(format)),
        };

        let stop = Arc::new(AtomicBool::new(false));
        let feeder = {
            let ring = Arc::clone(&ring);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut chunk = Vec::with_capacity(FEED_CHUNK);
                while !stop.load(Ordering::Relaxed) {
                    chunk.clear();
                    while chunk.len() < FEED_CHUNK {
                        match consumer.pop() {
                            Ok(sample) => chunk.push(sample),
                            Err(_) => break,
                        }
                    }
                    if chunk.is_empty() {
                        thread::sleep(Duration::from_millis(1));
                    } else {
                        ring.append(&chunk);
                    }
                }
                log::debug!("[Capture] feeder thread exiting");
            })
        };

        stream.play()?;

        Ok((
            Self {
                stream: Some(stream),
                feeder: Some(feeder),
                stop,
                analysis_rate,
            },
            ring,
        ))
    }

    /// Effective analysis rate after decimation.
    pub fn analysis_rate(&self) -> u32 {
        self.analysis_rate
    }

    /// Stop the device stream and join the feeder.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        // Dropping the cpal stream stops the callback.
        self.stream = None;
        if let Some(handle) = self.feeder.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        self.stop();
    }
}
