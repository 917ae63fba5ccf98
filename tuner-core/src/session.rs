//! # Tuning Session Module
//!
//! Drives the user through the strings of an instrument one at a time.
//!
//! The session owns the selected instrument, the index of the string being
//! tuned, the set of strings already confirmed, and a stability timer. Every
//! frequency estimate either starts, keeps, or resets the timer; once the
//! estimate has stayed within tolerance long enough the string is marked
//! tuned and the session moves on to the next one. Each string change is
//! pushed to the pitch detector as its new target frequency.
//!
//! Every mutating call returns the [`SessionEvent`]s it produced, so callers
//! can observe progress without polling the session.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::instrument::{Instrument, InstrumentString};
use crate::pitch::PitchDetector;

/// Lifecycle of a tuning run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No instrument selected, or not running
    Idle,
    /// Tuning the string at this index
    Tuning(usize),
    /// Every string has been tuned
    Complete,
}

/// Progress notifications produced by the session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    InstrumentSelected { instrument: Instrument },
    Started { index: usize, target: f32 },
    Stopped,
    /// The estimate entered tolerance and the stability timer started
    StabilityStarted { index: usize },
    /// The estimate left tolerance or went absent while the timer was running
    StabilityReset { index: usize },
    StringTuned { index: usize, note: &'static str },
    Advanced { index: usize, target: f32 },
    Completed,
}

/// State machine for one tuning run.
#[derive(Debug)]
pub struct TuningSession {
    detector: Arc<PitchDetector>,
    config: SessionConfig,
    instrument: Option<Instrument>,
    state: SessionState,
    current_string_index: usize,
    tuned_strings: BTreeSet<usize>,
    stability_window_start: Option<Instant>,
}

impl TuningSession {
    pub fn new(detector: Arc<PitchDetector>, config: SessionConfig) -> Self {
        Self {
            detector,
            config,
            instrument: None,
            state: SessionState::Idle,
            current_string_index: 0,
            tuned_strings: BTreeSet::new(),
            stability_window_start: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn instrument(&self) -> Option<Instrument> {
        self.instrument
    }

    pub fn current_string_index(&self) -> usize {
        self.current_string_index
    }

    /// The string currently being tuned, if an instrument is selected.
    pub fn current_string(&self) -> Option<&'static InstrumentString> {
        let strings = self.instrument?.strings();
        strings.get(self.clamped_index(strings.len()))
    }

    pub fn tuned_strings(&self) -> &BTreeSet<usize> {
        &self.tuned_strings
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, SessionState::Tuning(_))
    }

    pub fn is_complete(&self) -> bool {
        self.state == SessionState::Complete
    }

    /// When the current in-tolerance stretch began, if one is in progress.
    pub fn stability_window_start(&self) -> Option<Instant> {
        self.stability_window_start
    }

    /// Selects an instrument and resets progress to its first string.
    ///
    /// The detector target moves to the first string. A running session keeps
    /// running from index 0; a completed one returns to idle.
    pub fn select_instrument(&mut self, instrument: Instrument) -> Vec<SessionEvent> {
        info!(%instrument, "instrument selected");
        self.instrument = Some(instrument);
        self.reset_progress();
        if self.state == SessionState::Complete {
            self.state = SessionState::Idle;
        }
        if self.is_running() {
            self.state = SessionState::Tuning(0);
        }
        self.push_target();
        vec![SessionEvent::InstrumentSelected { instrument }]
    }

    /// Begins a run at the first string.
    ///
    /// Starting while already tuning is a no-op. Starting from idle or from a
    /// completed run resets progress. Without an instrument nothing happens.
    pub fn start(&mut self) -> Vec<SessionEvent> {
        if self.is_running() {
            debug!("start ignored, session already running");
            return Vec::new();
        }
        let Some(instrument) = self.instrument else {
            warn!("start ignored, no instrument selected");
            return Vec::new();
        };

        self.reset_progress();
        self.state = SessionState::Tuning(0);
        let target = self.push_target().unwrap_or_default();
        info!(%instrument, target, "tuning session started");
        vec![SessionEvent::Started { index: 0, target }]
    }

    /// Ends the run and clears the detector target. Idempotent.
    pub fn stop(&mut self) -> Vec<SessionEvent> {
        if self.state == SessionState::Idle {
            return Vec::new();
        }
        self.state = SessionState::Idle;
        self.stability_window_start = None;
        self.detector.set_target(None);
        info!("tuning session stopped");
        vec![SessionEvent::Stopped]
    }

    /// Feeds one frequency estimate into the progression.
    ///
    /// Only meaningful while tuning. An absent estimate, or one further than
    /// the tolerance from the current target, resets the stability timer. An
    /// in-tolerance estimate starts the timer, or, once it has run for the
    /// required duration, confirms the current string.
    ///
    /// # Arguments
    /// * `estimate` - Detected frequency in Hz, `None` when nothing was detected
    /// * `now` - Time the estimate is observed
    pub fn on_frequency_estimate(&mut self, estimate: Option<f32>, now: Instant) -> Vec<SessionEvent> {
        if !self.is_running() {
            return Vec::new();
        }
        let Some(string) = self.current_string() else {
            return Vec::new();
        };
        let index = self.current_string_index;

        let in_tolerance = estimate
            .is_some_and(|freq| (freq - string.target).abs() <= self.config.tolerance_hz);

        if !in_tolerance {
            return match self.stability_window_start.take() {
                Some(_) => {
                    debug!(index, ?estimate, "estimate left tolerance, stability reset");
                    vec![SessionEvent::StabilityReset { index }]
                }
                None => Vec::new(),
            };
        }

        let Some(started) = self.stability_window_start else {
            self.stability_window_start = Some(now);
            debug!(index, ?estimate, "estimate entered tolerance");
            return vec![SessionEvent::StabilityStarted { index }];
        };

        if now.saturating_duration_since(started) < self.config.stability()
            || self.tuned_strings.contains(&index)
        {
            return Vec::new();
        }

        self.confirm_current(string)
    }

    /// Marks the current string tuned and moves to the next one, or completes.
    fn confirm_current(&mut self, string: &'static InstrumentString) -> Vec<SessionEvent> {
        let index = self.current_string_index;
        let string_count = self.instrument.map_or(0, |i| i.strings().len());

        self.tuned_strings.insert(index);
        self.stability_window_start = None;
        info!(index, note = string.note, "string tuned");
        let mut events = vec![SessionEvent::StringTuned {
            index,
            note: string.note,
        }];

        if index + 1 < string_count {
            self.current_string_index = index + 1;
            self.state = SessionState::Tuning(self.current_string_index);
            let target = self.push_target().unwrap_or_default();
            debug!(index = self.current_string_index, target, "advanced to next string");
            events.push(SessionEvent::Advanced {
                index: self.current_string_index,
                target,
            });
        } else {
            self.state = SessionState::Complete;
            info!("all strings tuned");
            events.push(SessionEvent::Completed);
        }
        events
    }

    fn reset_progress(&mut self) {
        self.current_string_index = 0;
        self.tuned_strings.clear();
        self.stability_window_start = None;
    }

    /// Sends the current string's frequency to the detector.
    fn push_target(&self) -> Option<f32> {
        let target = self.current_string().map(|s| s.target);
        self.detector.set_target(target);
        target
    }

    /// Keeps the index inside `0..len`, failing loudly in debug builds.
    fn clamped_index(&self, len: usize) -> usize {
        debug_assert!(
            self.current_string_index < len,
            "string index {} out of range for {} strings",
            self.current_string_index,
            len
        );
        self.current_string_index.min(len.saturating_sub(1))
    }
}
