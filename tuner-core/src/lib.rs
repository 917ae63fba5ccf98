// tuner-core/src/lib.rs

//! The core logic for the instrument tuner.
//! This crate is responsible for audio capture, pitch detection, and
//! guiding a tuning session string by string. It is completely headless
//! and contains no presentation code.

pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod instrument;
pub mod pitch;
pub mod session;

pub use config::{DetectorConfig, SessionConfig, TunerConfig};
pub use engine::{AudioFrame, FrameSink, TunerEngine, TunerSnapshot, TunerUpdate};
pub use error::{TunerError, TunerResult};
pub use instrument::{Instrument, InstrumentString};
pub use pitch::PitchDetector;
pub use session::{SessionEvent, SessionState, TuningSession};
