//! End-to-end measurement of synthetic watch recordings.
//!
//! These tests run the full engine over generated tick trains and check
//! the published snapshots:
//! - beat rate guessing against the standard table
//! - daily rate sign and size for an off-rate movement
//! - beat error, amplitude band and recovered tick events
//! - the machine calibration correction applied to the daily rate

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tickscope::{AudioSource, Engine, EngineConfig, SharedAudioRing, Snapshot, TimingParams};

const RATE: u32 = 12_000;

fn test_config() -> EngineConfig {
    EngineConfig {
        sample_rate: RATE,
        base_window_seconds: 2,
        resolution_steps: 2,
        event_capacity: 128,
        calibration_capacity: 600,
    }
}

/// Tick train for a movement with a full cycle of `period` samples: the
/// louder tic at `tic_phase` of each cycle, the quieter toc at
/// `toc_phase`, both 12-sample alternating transients.
fn watch_train(len: usize, period: f64, tic_phase: usize, toc_phase: usize) -> Vec<f32> {
    let mut samples = vec![0.0f32; len];
    let mut cycle = 0.0f64;
    loop {
        let base = cycle.round() as usize;
        if base + toc_phase + 12 >= len {
            break;
        }
        for d in 0..12 {
            let sign = if d % 2 == 0 { 1.0 } else { -1.0 };
            samples[base + tic_phase + d] = sign;
            samples[base + toc_phase + d] = 0.8 * sign;
        }
        cycle += period;
    }
    samples
}

fn start_engine(config: EngineConfig) -> (Arc<SharedAudioRing>, Engine) {
    let ring = Arc::new(SharedAudioRing::new(config.largest_window_samples(), 1));
    let engine = Engine::start(Arc::clone(&ring) as Arc<dyn AudioSource>, config);
    (ring, engine)
}

fn wait_for<T>(what: &str, mut probe: impl FnMut() -> Option<T>) -> T {
    for _ in 0..500 {
        if let Some(value) = probe() {
            return value;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}

fn measure(signal: &[f32], params: TimingParams) -> Arc<Snapshot> {
    let (ring, engine) = start_engine(test_config());
    ring.append(signal);
    engine.request_recompute(params);
    let snap = wait_for("a published snapshot", || {
        engine
            .current_snapshot()
            .filter(|s| s.end_timestamp == signal.len() as u64)
    });
    engine.shutdown();
    snap
}

/// A movement dead on 21,600 bph: every published figure should match
/// the construction.
#[test]
fn test_nominal_watch_measurement() {
    // Cycle of 4000 samples, tic->toc spacing 1900: 100 samples of beat
    // error against the 2000-sample half period.
    let signal = watch_train(48_000, 4_000.0, 1_200, 3_100);
    let snap = measure(&signal, TimingParams::default());

    assert!(!snap.is_old);
    assert_eq!(snap.window_len, 48_000, "the largest locked window wins");
    assert!(
        (snap.period - 4_000.0).abs() < 1.0,
        "period {} should land on 4000",
        snap.period
    );
    assert_eq!(snap.guessed_bph, 21_600.0);
    assert!(
        snap.day_rate.abs() < 5.0,
        "a nominal movement should read near zero, got {} s/day",
        snap.day_rate
    );
    assert!(
        (snap.beat_error_ms() - 8.33).abs() < 0.4,
        "beat error should be 100 samples = 8.33 ms, got {}",
        snap.beat_error_ms()
    );

    let amplitude = snap.amplitude.expect("amplitude should be measurable");
    assert!(
        (135.0..360.0).contains(&amplitude),
        "amplitude {} outside the plausible band",
        amplitude
    );
    assert!(snap.tic_width > 0.0 && snap.toc_width > 0.0);

    // Tic and toc sit 1900 samples apart whichever one was labeled first.
    let d = (snap.toc - snap.tic).rem_euclid(snap.period);
    let spread = d.min(snap.period - d);
    assert!(
        (spread - 1_900.0).abs() < 40.0,
        "tic/toc spread {} should be near 1900",
        spread
    );

    // The folded waveform covers one cycle.
    assert!(
        (3_999..=4_001).contains(&snap.waveform.len()),
        "waveform holds one period, got {} bins",
        snap.waveform.len()
    );

    // Recovered events walk the beat grid.
    assert!(
        snap.events.len() >= 10,
        "expected a dozen events, got {}",
        snap.events.len()
    );
    for pair in snap.events.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(
            (1_700..2_300).contains(&gap),
            "event gap {} strays from the beat grid",
            gap
        );
    }
}

/// Tocs exactly half a cycle after the tics: the spacing detector must
/// read half the period and the beat error must vanish.
#[test]
fn test_even_beat_reads_zero_beat_error() {
    let signal = watch_train(48_000, 4_000.0, 1_200, 3_200);
    let snap = measure(&signal, TimingParams::default());

    assert!(
        (snap.period - 4_000.0).abs() < 1.0,
        "period {} should land on 4000",
        snap.period
    );
    assert!(
        snap.beat_error_ms() < 0.5,
        "an even beat should read near zero, got {} ms",
        snap.beat_error_ms()
    );
    let d = (snap.toc - snap.tic).rem_euclid(snap.period);
    let spread = d.min(snap.period - d);
    assert!(
        (spread - 2_000.0).abs() < 10.0,
        "tic/toc spread {} should be half the period",
        spread
    );
}

/// A movement beating slightly short of its nominal period reads fast,
/// and the standard-rate table still recognizes it as 21,600 bph.
#[test]
fn test_fast_watch_reads_positive_day_rate() {
    let signal = watch_train(48_000, 3_996.0, 1_200, 3_100);
    let snap = measure(&signal, TimingParams::default());

    assert_eq!(
        snap.guessed_bph, 21_600.0,
        "4 samples off nominal is well inside the snap band"
    );
    // 86400 * (4000/3996 - 1) = +86.5 s/day.
    assert!(
        (80.0..95.0).contains(&snap.day_rate),
        "expected roughly +86 s/day, got {}",
        snap.day_rate
    );
}

/// The machine calibration parameter moves the daily rate by its own
/// value: a capture clock known to run 5 s/day fast means the movement
/// is 5 s/day faster than the raw reading.
#[test]
fn test_calibration_parameter_shifts_day_rate() {
    let signal = watch_train(48_000, 3_996.0, 1_200, 3_100);
    let (ring, engine) = start_engine(test_config());
    ring.append(&signal);

    let raw = TimingParams::default();
    engine.request_recompute(raw);
    let uncorrected = wait_for("the uncorrected snapshot", || {
        engine
            .current_snapshot()
            .filter(|s| s.params.calibration == 0.0)
    });

    let corrected_params = TimingParams {
        calibration: 5.0,
        ..raw
    };
    engine.request_recompute(corrected_params);
    let corrected = wait_for("the corrected snapshot", || {
        engine
            .current_snapshot()
            .filter(|s| s.params.calibration == 5.0)
    });
    engine.shutdown();

    let shift = corrected.day_rate - uncorrected.day_rate;
    assert!(
        (shift - 5.0).abs() < 0.1,
        "a 5 s/day calibration should shift the rate by 5 s/day, got {}",
        shift
    );
}

/// Silence never publishes anything.
#[test]
fn test_silence_publishes_nothing() {
    let (ring, engine) = start_engine(test_config());
    ring.append(&vec![0.0f32; 48_000]);
    engine.request_recompute(TimingParams::default());

    // Give the worker ample time to run the cycle and fail it.
    for _ in 0..50 {
        assert!(
            engine.current_snapshot().is_none(),
            "silence must not produce a snapshot"
        );
        thread::sleep(Duration::from_millis(10));
    }
    engine.shutdown();
}
