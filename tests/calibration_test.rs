//! Drift calibration against a 1 Hz reference, end to end.
//!
//! A capture clock that runs fast stretches the apparent spacing of a
//! once-per-second reference signal. These tests feed such references
//! through the engine's calibration mode and check:
//! - a clean stretched train measures its known drift with confidence
//! - a steady train measures zero
//! - a jittery reference fails the confidence limit
//! - an interrupted run winds back to idle

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tickscope::calibration::CONFIDENCE_LIMIT;
use tickscope::{
    AudioSource, CalibrationStatus, Engine, EngineConfig, SharedAudioRing, TimingParams,
};

const RATE: u32 = 8_000;
const CAPACITY: usize = 40;

fn test_config() -> EngineConfig {
    EngineConfig {
        sample_rate: RATE,
        base_window_seconds: 2,
        resolution_steps: 2,
        event_capacity: 64,
        calibration_capacity: CAPACITY,
    }
}

/// Reference pips, nominally one per second, with the whole train
/// stretched by `drift` (fractional clock error; positive reads fast)
/// and each pip nudged by `jitter` samples. Pips are 100 samples wide so
/// a few samples of jitter keep the folded strides overlapping.
fn reference_train(seconds: usize, drift: f64, jitter: impl Fn(usize) -> i64) -> Vec<f32> {
    let len = seconds * RATE as usize;
    let mut samples = vec![0.0f32; len];
    for k in 0.. {
        let at = (k as f64 * RATE as f64 * (1.0 + drift)).round() as i64 + jitter(k);
        if at < 0 {
            continue;
        }
        let at = at as usize;
        if at + 100 >= len {
            break;
        }
        for d in 0..100 {
            samples[at + d] = 1.0;
        }
    }
    samples
}

/// Block until `target` reference cuts are ingested or the run reaches a
/// terminal state, and return the status seen.
fn wait_for_ingest(engine: &Engine, target: usize) -> CalibrationStatus {
    for _ in 0..500 {
        let status = engine.calibration_status();
        match status {
            CalibrationStatus::Idle => {}
            CalibrationStatus::Collecting { progress } => {
                if (progress * CAPACITY as f32).round() as usize >= target {
                    return status;
                }
            }
            _ => return status,
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("calibration made no progress toward {target} ingested windows");
}

/// Pre-fill the largest window, then feed one reference second per
/// cycle until the accumulator reaches a verdict.
fn run_calibration(samples: &[f32]) -> CalibrationStatus {
    let config = test_config();
    let ring = Arc::new(SharedAudioRing::new(config.largest_window_samples(), 1));
    let engine = Engine::start(Arc::clone(&ring) as Arc<dyn AudioSource>, config);
    let params = TimingParams::default();

    let (head, rest) = samples.split_at(config.largest_window_samples());
    ring.append(head);
    engine.set_calibrating(true);

    let mut fed = 0usize;
    for chunk in rest.chunks(RATE as usize) {
        if chunk.len() < RATE as usize {
            break;
        }
        ring.append(chunk);
        fed += 1;
        engine.request_recompute(params);
        let status = wait_for_ingest(&engine, fed.min(CAPACITY));
        if !matches!(status, CalibrationStatus::Collecting { .. }) {
            engine.shutdown();
            return status;
        }
    }

    let status = engine.calibration_status();
    engine.shutdown();
    status
}

/// A clock error of 1e-5 stretches each reference second by 0.08
/// samples; over 40 phase samples the regression should recover
/// 1e-5 * 86400 = 0.864 s/day.
#[test]
fn test_fast_capture_clock_measures_positive_drift() {
    let samples = reference_train(46, 1e-5, |_| 0);
    match run_calibration(&samples) {
        CalibrationStatus::Succeeded(estimate) => {
            assert!(
                (estimate.seconds_per_day - 0.864).abs() < 0.15,
                "expected about +0.864 s/day, got {}",
                estimate.seconds_per_day
            );
            assert!(estimate.is_confident());
            assert_eq!(estimate.samples, CAPACITY);
        }
        status => panic!("expected a confident estimate, got {status:?}"),
    }
}

/// A dead-steady reference measures no drift.
#[test]
fn test_steady_reference_measures_zero() {
    let samples = reference_train(46, 0.0, |_| 0);
    match run_calibration(&samples) {
        CalibrationStatus::Succeeded(estimate) => {
            assert!(
                estimate.seconds_per_day.abs() < 0.05,
                "a steady train should measure zero, got {}",
                estimate.seconds_per_day
            );
            assert!(estimate.is_confident());
        }
        status => panic!("expected a confident estimate, got {status:?}"),
    }
}

/// Pips wobbling several samples around their nominal positions leave
/// too much regression residual for a confident fit.
#[test]
fn test_jittery_reference_fails_the_confidence_limit() {
    // Zero-mean pattern cycling every 13 pips, +/-6 samples.
    let samples = reference_train(46, 0.0, |k| ((k * 5) % 13) as i64 - 6);
    match run_calibration(&samples) {
        CalibrationStatus::Failed { confidence } => {
            assert!(
                confidence > CONFIDENCE_LIMIT,
                "failure must carry the offending confidence, got {confidence}"
            );
        }
        status => panic!("expected a confidence failure, got {status:?}"),
    }
}

/// Cancelling mid-run discards the partial collection.
#[test]
fn test_cancelled_run_returns_to_idle() {
    let config = test_config();
    let ring = Arc::new(SharedAudioRing::new(config.largest_window_samples(), 1));
    let engine = Engine::start(Arc::clone(&ring) as Arc<dyn AudioSource>, config);
    let params = TimingParams::default();

    let samples = reference_train(15, 0.0, |_| 0);
    let (head, rest) = samples.split_at(config.largest_window_samples());
    ring.append(head);
    engine.set_calibrating(true);

    for (fed, chunk) in rest.chunks(RATE as usize).take(10).enumerate() {
        ring.append(chunk);
        engine.request_recompute(params);
        wait_for_ingest(&engine, fed + 1);
    }
    match engine.calibration_status() {
        CalibrationStatus::Collecting { progress } => {
            assert!(
                (progress - 0.25).abs() < 1e-3,
                "10 of 40 windows should read 25%, got {progress}"
            );
        }
        status => panic!("expected a run in progress, got {status:?}"),
    }

    engine.set_calibrating(false);
    for _ in 0..500 {
        if engine.calibration_status() == CalibrationStatus::Idle {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(engine.calibration_status(), CalibrationStatus::Idle);
    assert!(engine.take_calibration().is_none());
    engine.shutdown();
}
