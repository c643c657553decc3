use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::Level;

use tickscope::calibration::CONFIDENCE_LIMIT;
use tickscope::engine::snapshot;
use tickscope::{
    AppConfig, AudioSource, CalibrationStatus, CaptureStream, Engine, SharedAudioRing, Snapshot,
    TimingParams,
};

#[derive(Parser, Debug)]
#[command(name = "tickscope", about = "Acoustic timing machine for mechanical watches")]
struct Cli {
    /// Load engine and timing defaults from this JSON config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log debug detail instead of the default info level.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Measure a WAV recording of a movement and print the result
    Analyze {
        /// Path to the recording.
        file: PathBuf,
        #[command(flatten)]
        timing: TimingArgs,
        /// Print the final snapshot as JSON instead of a text report.
        #[arg(long)]
        json: bool,
    },
    /// Listen on the default input device and print live measurements
    Live {
        /// How long to listen, in seconds. 0 runs until interrupted.
        #[arg(long, default_value_t = 60)]
        seconds: u64,
        #[command(flatten)]
        timing: TimingArgs,
        /// Print snapshots as JSON lines instead of a text ticker.
        #[arg(long)]
        json: bool,
    },
    /// Measure the capture clock against a 1 Hz reference recording
    Calibrate {
        /// Path to a recording of the reference signal.
        file: PathBuf,
        /// Write the measured drift back into the config file.
        #[arg(long)]
        save: bool,
    },
}

#[derive(Args, Debug, Clone)]
struct TimingArgs {
    /// Beat rate in beats per hour; 0 guesses from the standard table.
    #[arg(long)]
    bph: Option<f64>,
    /// Escapement lift angle in degrees.
    #[arg(long)]
    lift_angle: Option<f64>,
    /// Capture clock drift in seconds per day, from `tickscope calibrate`.
    #[arg(long)]
    calibration: Option<f64>,
}

impl TimingArgs {
    /// Config file values fill in whatever the command line leaves unset.
    fn resolve(&self, defaults: TimingParams) -> TimingParams {
        TimingParams {
            bph: self.bph.unwrap_or(defaults.bph),
            lift_angle: self.lift_angle.unwrap_or(defaults.lift_angle),
            calibration: self.calibration.unwrap_or(defaults.calibration),
        }
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::from(1)
        }
    }
}

fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    let app = match &cli.config {
        Some(path) => AppConfig::load_from_file(path),
        None => AppConfig::default(),
    };

    match cli.command {
        Commands::Analyze { file, timing, json } => run_analyze(&app, &file, &timing, json),
        Commands::Live {
            seconds,
            timing,
            json,
        } => run_live(&app, seconds, &timing, json),
        Commands::Calibrate { file, save } => run_calibrate(app, cli.config, &file, save),
    }
}

fn run_analyze(app: &AppConfig, file: &Path, timing: &TimingArgs, json: bool) -> Result<ExitCode> {
    let (samples, wav_rate) = read_wav(file)?;
    if samples.is_empty() {
        bail!("{} holds no samples", file.display());
    }
    let mut config = app.engine;
    config.sample_rate = wav_rate;
    let params = timing.resolve(app.timing);

    let ring = Arc::new(SharedAudioRing::new(config.largest_window_samples(), 1));
    let engine = Engine::start(Arc::clone(&ring) as Arc<dyn AudioSource>, config);

    // Feed in quarter-second chunks with a recompute per second of audio,
    // so the measurement sharpens exactly as it would live.
    let chunk_len = (wav_rate as usize / 4).max(1);
    let mut next_recompute = wav_rate as u64;
    let mut fed = 0u64;
    for chunk in samples.chunks(chunk_len) {
        ring.append(chunk);
        fed += chunk.len() as u64;
        if fed >= next_recompute {
            engine.request_recompute(params);
            next_recompute += wav_rate as u64;
        }
    }
    engine.request_recompute(params);

    let snap = wait_for_snapshot(&engine, samples.len() as u64, Duration::from_secs(10))?;
    engine.shutdown();

    if json {
        println!("{}", serde_json::to_string(&*snap)?);
    } else {
        print_report(&snap);
    }
    Ok(ExitCode::SUCCESS)
}

/// Poll until the engine has digested the whole feed, settling for the
/// freshest snapshot available if the tail never locks.
fn wait_for_snapshot(engine: &Engine, end: u64, patience: Duration) -> Result<Arc<Snapshot>> {
    let deadline = Instant::now() + patience;
    let mut latest = None;
    let mut seen: Option<(u64, bool)> = None;
    let mut since = Instant::now();
    while Instant::now() < deadline {
        latest = engine.current_snapshot();
        if latest.as_ref().is_some_and(|s| s.end_timestamp >= end) {
            break;
        }
        // A snapshot that stops moving means the worker drained its queue
        // and the remaining audio never locked.
        let key = latest.as_ref().map(|s| (s.end_timestamp, s.is_old));
        if key != seen {
            seen = key;
            since = Instant::now();
        } else if key.is_some() && since.elapsed() > Duration::from_secs(1) {
            break;
        }
        thread::sleep(Duration::from_millis(20));
    }
    latest.context("no analysis window ever locked; is a watch audible in this input?")
}

fn print_report(snap: &Snapshot) {
    let measured = snapshot::measured_bph(snap.period, snap.sample_rate);
    println!("Beat rate   {:>9.0} bph (measured {:.1})", snap.guessed_bph, measured);
    println!("Rate        {:>+9.1} s/day", snap.day_rate);
    println!("Beat error  {:>9.2} ms", snap.beat_error_ms());
    match snap.amplitude {
        Some(degrees) => println!("Amplitude   {:>9.0} deg", degrees),
        None => println!("Amplitude         n/a"),
    }
    println!(
        "Window      {:>9.0} s at {} Hz{}",
        snap.window_len as f64 / snap.sample_rate as f64,
        snap.sample_rate,
        if snap.is_old { " (stale)" } else { "" }
    );
    println!("Events      {:>9}", snap.events.len());
}

fn run_live(app: &AppConfig, seconds: u64, timing: &TimingArgs, json: bool) -> Result<ExitCode> {
    let mut config = app.engine;
    let params = timing.resolve(app.timing);

    let (mut capture, ring) =
        CaptureStream::start(config.sample_rate, config.largest_window_seconds())?;
    config.sample_rate = capture.analysis_rate();
    let engine = Engine::start(Arc::clone(&ring) as Arc<dyn AudioSource>, config);

    let started = Instant::now();
    let mut shown = 0u64;
    while seconds == 0 || started.elapsed() < Duration::from_secs(seconds) {
        thread::sleep(Duration::from_millis(500));
        engine.request_recompute(params);
        if let Some(snap) = engine.current_snapshot() {
            if snap.end_timestamp != shown {
                shown = snap.end_timestamp;
                if json {
                    println!("{}", serde_json::to_string(&*snap)?);
                } else {
                    print_ticker_line(&snap);
                }
            }
        }
    }
    capture.stop();
    engine.shutdown();
    Ok(ExitCode::SUCCESS)
}

fn print_ticker_line(snap: &Snapshot) {
    let amplitude = snap
        .amplitude
        .map(|degrees| format!("{degrees:3.0} deg"))
        .unwrap_or_else(|| "  n/a  ".into());
    println!(
        "{:7.1}s  {:+7.1} s/day  beat {:5.2} ms  amp {}  {:5.0} bph{}",
        snap.end_timestamp as f64 / snap.sample_rate as f64,
        snap.day_rate,
        snap.beat_error_ms(),
        amplitude,
        snap.guessed_bph,
        if snap.is_old { "  (stale)" } else { "" }
    );
}

fn run_calibrate(
    mut app: AppConfig,
    config_path: Option<PathBuf>,
    file: &Path,
    save: bool,
) -> Result<ExitCode> {
    if save && config_path.is_none() {
        bail!("--save needs --config to know where to write");
    }
    let (samples, wav_rate) = read_wav(file)?;
    let mut config = app.engine;
    config.sample_rate = wav_rate;

    // One phase sample per second of reference, and the largest window
    // must fill before the first one.
    let history = config.largest_window_samples();
    let needed = config.calibration_capacity * wav_rate as usize + history;
    if samples.len() < needed {
        bail!(
            "{} holds {:.0} s of audio but this calibration needs {:.0} s",
            file.display(),
            samples.len() as f64 / wav_rate as f64,
            needed as f64 / wav_rate as f64
        );
    }

    let ring = Arc::new(SharedAudioRing::new(history, 1));
    let engine = Engine::start(Arc::clone(&ring) as Arc<dyn AudioSource>, config);

    let (head, rest) = samples.split_at(history);
    ring.append(head);
    engine.set_calibrating(true);

    let params = TimingParams::default();
    let capacity = config.calibration_capacity;
    let mut fed = 0usize;
    for chunk in rest.chunks(wav_rate as usize) {
        if chunk.len() < wav_rate as usize {
            break;
        }
        ring.append(chunk);
        fed += 1;
        engine.request_recompute(params);
        // Wait for this cut to be ingested; otherwise queued recomputes
        // coalesce and reference seconds are skipped.
        let target = fed.min(capacity);
        wait_until(Duration::from_secs(5), || match engine.calibration_status() {
            CalibrationStatus::Collecting { progress } => {
                (progress * capacity as f32).round() as usize >= target
            }
            CalibrationStatus::Idle => false,
            _ => true,
        })?;
        if !matches!(
            engine.calibration_status(),
            CalibrationStatus::Collecting { .. }
        ) {
            break;
        }
    }

    let status = engine.calibration_status();
    engine.shutdown();

    match status {
        CalibrationStatus::Succeeded(estimate) => {
            println!(
                "Capture clock drift {:+.4} s/day over {} reference seconds (confidence {:.4} s/day)",
                estimate.seconds_per_day, estimate.samples, estimate.confidence
            );
            if save {
                app.timing.calibration = estimate.seconds_per_day;
                if let Some(path) = config_path {
                    app.save_to_file(&path)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("Saved to {}", path.display());
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        CalibrationStatus::Failed { confidence } => {
            eprintln!(
                "Calibration did not converge: confidence {confidence:.4} s/day is above the {CONFIDENCE_LIMIT} s/day limit"
            );
            Ok(ExitCode::from(2))
        }
        status => bail!("calibration ended in state {status:?} without consuming the reference"),
    }
}

fn wait_until<F: Fn() -> bool>(patience: Duration, cond: F) -> Result<()> {
    let deadline = Instant::now() + patience;
    while Instant::now() < deadline {
        if cond() {
            return Ok(());
        }
        thread::sleep(Duration::from_millis(10));
    }
    bail!("timed out waiting for the analysis worker");
}

/// Decode a WAV file to mono f32, keeping the first channel.
fn read_wav(path: &Path) -> Result<(Vec<f32>, u32)> {
    let mut reader =
        hound::WavReader::open(path).with_context(|| format!("opening {}", path.display()))?;
    let spec = reader.spec();
    let channels = (spec.channels as usize).max(1);
    let mut samples = Vec::with_capacity(reader.len() as usize / channels);

    match spec.sample_format {
        hound::SampleFormat::Float => {
            for (i, sample) in reader.samples::<f32>().enumerate() {
                if i % channels == 0 {
                    samples.push(sample?);
                }
            }
        }
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1i64 << (spec.bits_per_sample - 1)) as f32;
            for (i, sample) in reader.samples::<i32>().enumerate() {
                if i % channels == 0 {
                    samples.push(sample? as f32 * scale);
                }
            }
        }
    }

    Ok((samples, spec.sample_rate))
}
