//! # Configuration Module
//!
//! Every tuning parameter the detector and the session controller rely on,
//! consolidated in one place. The constants are the values the tuner ships
//! with; the structs carry them at runtime so a JSON file can override any
//! subset without recompiling.
//!
//! ## Defaults
//! - Silence gate: 0.02 RMS on a [-1, 1] signal
//! - Correlation confidence: 0.2
//! - Search range: 30 Hz to 400 Hz, narrowed to ±10% around a target
//! - Tolerance: 2 Hz, held for 0.5 s
//! - Buffer size: 4096 samples

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::TunerError;

/// RMS amplitude below which a buffer is treated as silence.
pub const SILENCE_RMS_THRESHOLD: f32 = 0.02;
/// Minimum normalized autocorrelation for an estimate to be reported.
pub const CONFIDENCE_THRESHOLD: f32 = 0.2;
/// Lowest frequency searched when no target is set, in Hz.
pub const MIN_FREQUENCY: f32 = 30.0;
/// Highest frequency searched when no target is set, in Hz.
pub const MAX_FREQUENCY: f32 = 400.0;
/// Half-width of the search window around a target, as a fraction of it.
pub const TARGET_WINDOW: f32 = 0.10;
/// Maximum deviation from the target, in Hz, that still counts as in tune.
pub const TUNING_TOLERANCE_HZ: f32 = 2.0;
/// How long an estimate must stay in tolerance before a string is tuned.
pub const STABILITY_SECS: f32 = 0.5;
/// Number of samples per analysis frame.
///
/// 4096 samples at 44.1 kHz is ~93 ms, long enough to hold more than three
/// periods of the lowest bass string (E1, 41.2 Hz). Smaller sizes trade
/// low-frequency resolution for latency.
pub const BUFFER_SIZE: usize = 4096;

/// Parameters of the autocorrelation pitch detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub silence_rms_threshold: f32,
    pub confidence_threshold: f32,
    pub min_frequency: f32,
    pub max_frequency: f32,
    /// Fraction of the target frequency searched on either side of it.
    pub target_window: f32,
    /// Re-centre the best lag on the overlap-normalized correlation peak and
    /// interpolate it to sub-sample precision.
    pub refine_period: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            silence_rms_threshold: SILENCE_RMS_THRESHOLD,
            confidence_threshold: CONFIDENCE_THRESHOLD,
            min_frequency: MIN_FREQUENCY,
            max_frequency: MAX_FREQUENCY,
            target_window: TARGET_WINDOW,
            refine_period: true,
        }
    }
}

/// Parameters of the tuning progression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub tolerance_hz: f32,
    pub stability_secs: f32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tolerance_hz: TUNING_TOLERANCE_HZ,
            stability_secs: STABILITY_SECS,
        }
    }
}

impl SessionConfig {
    /// Required continuous in-tolerance residence before a string counts as tuned.
    pub fn stability(&self) -> Duration {
        Duration::try_from_secs_f32(self.stability_secs.max(0.0)).unwrap_or(Duration::MAX)
    }
}

/// Top-level configuration for a tuner engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerConfig {
    pub buffer_size: usize,
    pub detector: DetectorConfig,
    pub session: SessionConfig,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            buffer_size: BUFFER_SIZE,
            detector: DetectorConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl TunerConfig {
    /// Loads a configuration from a JSON file.
    ///
    /// Fields missing from the file keep their default values. The result is
    /// validated before it is returned.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: TunerConfig = serde_json::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every parameter is usable.
    pub fn validate(&self) -> Result<(), TunerError> {
        let d = &self.detector;
        let s = &self.session;

        if self.buffer_size == 0 {
            return Err(TunerError::InvalidConfig("buffer_size must be non-zero".into()));
        }
        if !(d.silence_rms_threshold > 0.0) {
            return Err(TunerError::InvalidConfig(format!(
                "silence_rms_threshold must be > 0, got {}",
                d.silence_rms_threshold
            )));
        }
        if !(d.confidence_threshold > 0.0 && d.confidence_threshold <= 1.0) {
            return Err(TunerError::InvalidConfig(format!(
                "confidence_threshold must be in (0, 1], got {}",
                d.confidence_threshold
            )));
        }
        if !(d.min_frequency > 0.0 && d.min_frequency < d.max_frequency) {
            return Err(TunerError::InvalidConfig(format!(
                "invalid frequency range {} - {} Hz",
                d.min_frequency, d.max_frequency
            )));
        }
        if !(d.target_window > 0.0 && d.target_window < 1.0) {
            return Err(TunerError::InvalidConfig(format!(
                "target_window must be in (0, 1), got {}",
                d.target_window
            )));
        }
        if !(s.tolerance_hz > 0.0) {
            return Err(TunerError::InvalidConfig(format!(
                "tolerance_hz must be > 0, got {}",
                s.tolerance_hz
            )));
        }
        if !(s.stability_secs >= 0.0) {
            return Err(TunerError::InvalidConfig(format!(
                "stability_secs must be >= 0, got {}",
                s.stability_secs
            )));
        }
        Ok(())
    }
}
