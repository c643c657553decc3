//! Configuration for the timing engine.
//!
//! Two layers: `TimingParams` are the per-movement inputs a user changes
//! between runs (assumed beat rate, lift angle, machine calibration), while
//! `EngineConfig` fixes the resolution ladder and buffer sizes at startup.
//! Both serialize to JSON so a front end can persist them; the same derives
//! feed snapshot export.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

/// Per-movement timing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimingParams {
    /// Assumed beat rate in beats per hour. 0 means guess from the
    /// measured period against the standard rate table.
    pub bph: f64,
    /// Escapement lift angle in degrees, used for amplitude conversion.
    pub lift_angle: f64,
    /// Drift of the analyzing machine's own clock in seconds per day, as
    /// measured by the calibration mode. Applied to the effective sample
    /// rate when computing the daily rate.
    pub calibration: f64,
}

impl Default for TimingParams {
    fn default() -> Self {
        Self {
            bph: 0.0,
            // 52 degrees is the customary figure for a Swiss lever
            // escapement and what most machines default to.
            lift_angle: 52.0,
            calibration: 0.0,
        }
    }
}

/// Engine-level configuration fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Analysis sample rate in Hz, after any input decimation.
    pub sample_rate: u32,
    /// Length of the shortest resolution window in seconds. Each further
    /// step doubles it.
    pub base_window_seconds: u32,
    /// Number of resolution steps. 4 steps at a 2 s base gives 2/4/8/16 s
    /// windows.
    pub resolution_steps: usize,
    /// Capacity of the recovered-event ring published in each snapshot.
    pub event_capacity: usize,
    /// Number of (elapsed, phase) samples the drift calibration collects
    /// before regressing. At one sample per second, 600 is ten minutes.
    pub calibration_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            base_window_seconds: 2,
            resolution_steps: 4,
            event_capacity: 128,
            calibration_capacity: 600,
        }
    }
}

impl EngineConfig {
    /// Window length in samples for a resolution step.
    pub fn window_samples(&self, step: usize) -> usize {
        (self.base_window_seconds as usize) * (self.sample_rate as usize) * (1 << step)
    }

    /// Length of the largest window, which is also the audio history the
    /// source must retain.
    pub fn largest_window_samples(&self) -> usize {
        self.window_samples(self.resolution_steps.saturating_sub(1))
    }

    /// The same history in seconds, independent of the sample rate. Live
    /// capture sizes its ring from this because the effective rate is not
    /// known until the device is open.
    pub fn largest_window_seconds(&self) -> u32 {
        self.base_window_seconds << self.resolution_steps.saturating_sub(1)
    }
}

/// Complete application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub timing: TimingParams,
}

impl AppConfig {
    /// Load configuration from a JSON file, falling back to defaults if the
    /// file is missing or malformed.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Self {
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => {
                    log::info!("[Config] Loaded configuration from {:?}", path.as_ref());
                    config
                }
                Err(err) => {
                    log::warn!(
                        "[Config] Failed to parse JSON from {:?}: {}. Using defaults.",
                        path.as_ref(),
                        err
                    );
                    Self::default()
                }
            },
            Err(err) => {
                log::warn!(
                    "[Config] Failed to read config file {:?}: {}. Using defaults.",
                    path.as_ref(),
                    err
                );
                Self::default()
            }
        }
    }

    /// Persist configuration as pretty-printed JSON.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        fs::write(&path, json)?;
        log::info!("[Config] Saved configuration to {:?}", path.as_ref());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.engine.sample_rate, 44_100);
        assert_eq!(config.engine.resolution_steps, 4);
        assert_eq!(config.timing.bph, 0.0);
        assert_eq!(config.timing.lift_angle, 52.0);
    }

    #[test]
    fn test_window_ladder_doubles() {
        let config = EngineConfig::default();
        assert_eq!(config.window_samples(0), 2 * 44_100);
        assert_eq!(config.window_samples(1), 4 * 44_100);
        assert_eq!(config.window_samples(3), 16 * 44_100);
        assert_eq!(config.largest_window_samples(), 16 * 44_100);
        assert_eq!(config.largest_window_seconds(), 16);
    }

    #[test]
    fn test_json_roundtrip() {
        let mut config = AppConfig::default();
        config.timing.bph = 21_600.0;
        config.timing.calibration = -0.35;

        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed, config);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = AppConfig::load_from_file("/nonexistent/tickscope.json");
        assert_eq!(config, AppConfig::default());
    }
}
