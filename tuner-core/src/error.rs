//! Error types for the tuner core

use thiserror::Error;

/// Errors surfaced to callers of the tuner core.
///
/// Transient "no pitch" conditions are not errors; they are absent estimates.
#[derive(Debug, Error)]
pub enum TunerError {
    /// Instrument id not present in the catalog
    #[error("Unknown instrument: {0}")]
    UnknownInstrument(String),

    /// Configuration value out of its valid range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// No audio input device could be opened
    #[error("No input device available")]
    NoInputDevice,

    /// The input device offers no usable f32 format
    #[error("No suitable f32 input format found")]
    UnsupportedInputFormat,

    /// The processing worker thread could not be spawned
    #[error("Failed to spawn processing worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    /// The processing worker is no longer running
    #[error("Processing worker has shut down")]
    WorkerGone,
}

/// Result type for tuner operations
pub type TunerResult<T> = Result<T, TunerError>;
