// Engine module - orchestrates capture, analysis and publication
//
// One worker thread owns every resolution window and its analyzer. Each
// recompute command cuts all windows out of the audio source under a
// single lock, analyzes them coarse to fine, and publishes the finest
// locked window as an immutable snapshot behind a mutex. Consumers clone
// the Arc and never block the worker.
//
// Command flow:
// 1. Recompute(params) - run one analysis cycle; pending recomputes
//    coalesce so a slow cycle never builds a backlog
// 2. Calibrate(on) - route the largest window into drift calibration
//    instead of timing analysis until enough samples are collected
// 3. Shutdown - exit the worker; also sent on drop

pub mod snapshot;

pub use snapshot::Snapshot;

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use tracing::{debug, info, warn};

use crate::analysis::{ProcessingBuffer, WindowAnalyzer};
use crate::audio::AudioSource;
use crate::calibration::{CalibrationAccumulator, DriftEstimate};
use crate::config::{EngineConfig, TimingParams};

enum Command {
    Recompute(TimingParams),
    Calibrate(bool),
    Shutdown,
}

/// Where a drift calibration run currently stands.
///
/// `Succeeded` and `Failed` persist until the next run starts, so a
/// caller that polls late still sees the outcome.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CalibrationStatus {
    Idle,
    Collecting { progress: f32 },
    Succeeded(DriftEstimate),
    Failed { confidence: f64 },
}

/// State shared between the worker and any number of consumers.
struct SharedState {
    snapshot: Mutex<Option<Arc<Snapshot>>>,
    calibration: Mutex<CalibrationStatus>,
}

impl SharedState {
    fn new() -> Self {
        Self {
            snapshot: Mutex::new(None),
            calibration: Mutex::new(CalibrationStatus::Idle),
        }
    }

    // A poisoned lock only means a panic elsewhere; the stored values are
    // plain data, so recover the guard.
    fn store_snapshot(&self, snap: Arc<Snapshot>) {
        *self.snapshot.lock().unwrap_or_else(|e| e.into_inner()) = Some(snap);
    }

    fn load_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.snapshot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_status(&self, status: CalibrationStatus) {
        *self.calibration.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    fn status(&self) -> CalibrationStatus {
        *self.calibration.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Handle to the analysis worker.
///
/// Cheap to share by reference; dropping the handle shuts the worker
/// down and joins it.
pub struct Engine {
    commands: Sender<Command>,
    shared: Arc<SharedState>,
    worker: Option<JoinHandle<()>>,
}

impl Engine {
    /// Spawn the worker over an audio source.
    ///
    /// The source must retain at least [`EngineConfig::largest_window_samples`]
    /// samples of history; shorter retention silently truncates the larger
    /// windows to whatever is available.
    pub fn start(source: Arc<dyn AudioSource>, config: EngineConfig) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(SharedState::new());
        let worker_shared = Arc::clone(&shared);

        let worker = thread::spawn(move || {
            let mut worker = EngineWorker::new(rx, worker_shared, source, config);
            worker.run();
        });

        Self {
            commands: tx,
            shared,
            worker: Some(worker),
        }
    }

    /// Ask the worker to run one analysis cycle with these parameters.
    ///
    /// Safe to call faster than cycles complete; queued requests collapse
    /// into the newest one.
    pub fn request_recompute(&self, params: TimingParams) {
        if self.commands.send(Command::Recompute(params)).is_err() {
            warn!("[Engine] Recompute requested after the worker exited");
        }
    }

    /// Latest published snapshot, if any window has locked yet.
    pub fn current_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.shared.load_snapshot()
    }

    /// Start or cancel drift calibration.
    pub fn set_calibrating(&self, on: bool) {
        if self.commands.send(Command::Calibrate(on)).is_err() {
            warn!("[Engine] Calibration toggled after the worker exited");
        }
    }

    pub fn calibration_status(&self) -> CalibrationStatus {
        self.shared.status()
    }

    /// Claim a finished calibration result, resetting the status to idle.
    ///
    /// Returns `None` while a run is still collecting, after a failed run,
    /// or when the result was already claimed.
    pub fn take_calibration(&self) -> Option<DriftEstimate> {
        let mut guard = self
            .shared
            .calibration
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let CalibrationStatus::Succeeded(estimate) = *guard {
            *guard = CalibrationStatus::Idle;
            Some(estimate)
        } else {
            None
        }
    }

    /// Stop the worker and wait for it to exit.
    pub fn shutdown(mut self) {
        self.stop_worker();
    }

    fn stop_worker(&mut self) {
        if let Some(handle) = self.worker.take() {
            let _ = self.commands.send(Command::Shutdown);
            if handle.join().is_err() {
                warn!("[Engine] Worker thread panicked");
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

/// The worker side: owns all analysis state, runs on its own thread.
struct EngineWorker {
    commands: Receiver<Command>,
    shared: Arc<SharedState>,
    source: Arc<dyn AudioSource>,
    config: EngineConfig,
    buffers: Vec<ProcessingBuffer>,
    analyzers: Vec<WindowAnalyzer>,
    calibrating: bool,
    calibration: CalibrationAccumulator,
    last_snapshot: Option<Arc<Snapshot>>,
}

impl EngineWorker {
    fn new(
        commands: Receiver<Command>,
        shared: Arc<SharedState>,
        source: Arc<dyn AudioSource>,
        config: EngineConfig,
    ) -> Self {
        let steps = config.resolution_steps.max(1);
        let mut buffers = Vec::with_capacity(steps);
        let mut analyzers = Vec::with_capacity(steps);
        for step in 0..steps {
            let window_len = config.window_samples(step);
            buffers.push(ProcessingBuffer::new(config.sample_rate, window_len));
            analyzers.push(WindowAnalyzer::new(config.sample_rate, window_len));
        }
        info!(
            "[Engine] Worker ready: {} windows ({:.0}s to {:.0}s) at {} Hz",
            steps,
            buffers[0].window_seconds(),
            buffers[steps - 1].window_seconds(),
            config.sample_rate
        );

        Self {
            commands,
            shared,
            source,
            config,
            buffers,
            analyzers,
            calibrating: false,
            calibration: CalibrationAccumulator::new(config.calibration_capacity),
            last_snapshot: None,
        }
    }

    fn run(&mut self) {
        loop {
            let mut command = match self.commands.recv() {
                Ok(command) => command,
                Err(_) => break,
            };

            // Drain the queue before running: the newest recompute wins,
            // calibration toggles apply in order, shutdown exits.
            let mut recompute = None;
            loop {
                match command {
                    Command::Shutdown => {
                        info!("[Engine] Worker shutting down");
                        return;
                    }
                    Command::Recompute(params) => recompute = Some(params),
                    Command::Calibrate(on) => self.set_calibrating(on),
                }
                match self.commands.try_recv() {
                    Ok(next) => command = next,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return,
                }
            }

            if let Some(params) = recompute {
                self.run_cycle(&params);
            }
        }
    }

    fn set_calibrating(&mut self, on: bool) {
        if on == self.calibrating {
            return;
        }
        self.calibrating = on;
        if on {
            self.calibration.clear();
            self.shared
                .set_status(CalibrationStatus::Collecting { progress: 0.0 });
            info!("[Engine] Drift calibration started");
        } else if !self.calibration.is_complete() {
            self.shared.set_status(CalibrationStatus::Idle);
            info!("[Engine] Drift calibration cancelled");
        }
    }

    /// One full cycle: cut, analyze every window, publish the best.
    fn run_cycle(&mut self, params: &TimingParams) {
        self.source.fill_windows(&mut self.buffers);

        let calibration_step = self.buffers.len() - 1;
        for step in 0..self.buffers.len() {
            let buf = &mut self.buffers[step];
            let analyzer = &mut self.analyzers[step];

            if self.calibrating && step == calibration_step {
                analyzer.analyze_reference(buf);
                self.ingest_calibration_window(step);
                continue;
            }

            match analyzer.analyze(buf, params) {
                Ok(()) => debug!(
                    "[Engine] {:.0}s window: period {:.2}, sigma {:.3}, locked {}",
                    buf.window_seconds(),
                    buf.period,
                    buf.sigma,
                    buf.is_locked()
                ),
                Err(err) => {
                    debug!("[Engine] {:.0}s window: {}", buf.window_seconds(), err)
                }
            }
        }

        self.publish(params);
    }

    /// Feed the reference fold of one window into the accumulator and
    /// mirror its state out to consumers.
    fn ingest_calibration_window(&mut self, step: usize) {
        let buf = &self.buffers[step];
        let outcome = self.calibration.ingest(
            &buf.folded,
            buf.folded_max_bin,
            buf.window_start(),
            buf.end_timestamp,
            buf.sample_rate,
        );
        if let Err(err) = &outcome {
            warn!("[Engine] Calibration window rejected: {}", err);
        }

        if self.calibration.is_complete() {
            self.calibrating = false;
            match self.calibration.result() {
                Some(estimate) if estimate.is_confident() => {
                    info!(
                        "[Engine] Drift calibration finished: {:+.4} s/day (confidence {:.4})",
                        estimate.seconds_per_day, estimate.confidence
                    );
                    self.shared.set_status(CalibrationStatus::Succeeded(estimate));
                }
                Some(estimate) => {
                    self.shared.set_status(CalibrationStatus::Failed {
                        confidence: estimate.confidence,
                    });
                }
                None => self.shared.set_status(CalibrationStatus::Idle),
            }
        } else {
            self.shared.set_status(CalibrationStatus::Collecting {
                progress: self.calibration.progress(),
            });
        }
    }

    /// Publish the finest locked window, or mark the previous snapshot
    /// stale when nothing locked this cycle.
    fn publish(&mut self, params: &TimingParams) {
        match self.buffers.iter().rev().find(|buf| buf.is_locked()) {
            Some(buf) => {
                let snap = Arc::new(Snapshot::from_buffer(
                    buf,
                    params,
                    self.config.event_capacity,
                ));
                debug!(
                    "[Engine] Publishing {:.0}s window: {:.0} bph, {:+.1} s/day, beat error {:.2} ms",
                    buf.window_seconds(),
                    snap.guessed_bph,
                    snap.day_rate,
                    snap.beat_error_ms()
                );
                self.last_snapshot = Some(Arc::clone(&snap));
                self.shared.store_snapshot(snap);
            }
            None => {
                // Keep showing the last good numbers, flagged so a front
                // end can grey them out. Only re-mark once.
                if let Some(prev) = &self.last_snapshot {
                    if !prev.is_old {
                        debug!("[Engine] No window locked, flagging previous snapshot stale");
                        let stale = Arc::new(Snapshot {
                            is_old: true,
                            ..(**prev).clone()
                        });
                        self.last_snapshot = Some(Arc::clone(&stale));
                        self.shared.store_snapshot(stale);
                    }
                }
            }
        }
    }
}
