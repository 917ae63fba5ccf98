//! # Tuner Engine Module
//!
//! Wires the pitch detector and the tuning session into the three contexts a
//! live tuner runs in:
//!
//! - **Capture context**: the audio callback hands buffers to a [`FrameSink`],
//!   which never blocks. Frames are dropped when the queue is full or the
//!   engine is stopped.
//! - **Processing worker**: one dedicated thread runs the detector on frames
//!   strictly in arrival order.
//! - **Observation context**: [`TunerEngine::pump`] drains finished estimates,
//!   updates the session, and publishes [`TunerUpdate`]s to subscribers.
//!
//! Each frame is tagged with the run generation it was captured in. `stop`
//! bumps the generation before returning, so estimates still in flight from
//! the previous run are discarded when they arrive instead of reviving it.
//!
//! Session timestamps come from the stream clock (samples delivered divided
//! by sample rate since `start`), so the stability window is measured in
//! audio time rather than in processing time.

use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::config::TunerConfig;
use crate::error::{TunerError, TunerResult};
use crate::instrument::{self, Instrument};
use crate::pitch::PitchDetector;
use crate::session::{SessionEvent, TuningSession};

/// Number of frames that may wait for the worker before new ones are dropped.
const FRAME_QUEUE_CAPACITY: usize = 8;

/// One buffer of mono samples as delivered by the capture layer.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: f32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: f32) -> Self {
        Self { samples, sample_rate }
    }

    pub fn frame_count(&self) -> usize {
        self.samples.len()
    }

    /// Length of the frame in stream time.
    ///
    /// `None` when the sample rate is not a positive finite number or the
    /// resulting length does not fit a [`Duration`].
    pub fn duration(&self) -> Option<Duration> {
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return None;
        }
        Duration::try_from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64).ok()
    }
}

/// Notifications published to subscribers from the observation context.
#[derive(Debug, Clone, PartialEq)]
pub enum TunerUpdate {
    Running(bool),
    /// Latest estimate; `None` while nothing is detected
    Frequency(Option<f32>),
    Session(SessionEvent),
}

/// Point-in-time view of everything the observation layer displays.
#[derive(Debug, Clone, PartialEq)]
pub struct TunerSnapshot {
    pub is_running: bool,
    pub instrument: Option<Instrument>,
    pub current_frequency: Option<f32>,
    pub current_string_index: usize,
    pub current_note: Option<&'static str>,
    pub target_frequency: Option<f32>,
    pub tuned_strings: BTreeSet<usize>,
    pub session_complete: bool,
}

impl TunerSnapshot {
    /// Deviation of the current frequency from the current string, in cents.
    pub fn cents_deviation(&self) -> Option<f32> {
        instrument::cents_deviation(self.current_frequency?, self.target_frequency?)
    }
}

/// Frame queued for the worker.
struct Job {
    generation: u64,
    stream_offset: Duration,
    frame: AudioFrame,
}

/// Estimate returned by the worker.
struct Estimate {
    generation: u64,
    stream_offset: Duration,
    frequency: Option<f32>,
}

/// Flags shared between the engine, its sinks and the worker.
#[derive(Debug, Default)]
struct SharedFlags {
    running: AtomicBool,
    generation: AtomicU64,
    /// Stream time delivered since the current run started, in nanoseconds.
    stream_nanos: AtomicU64,
    /// Frames queued whose estimates have not been drained yet.
    in_flight: AtomicUsize,
}

/// Cloneable, non-blocking entry point for the capture layer.
#[derive(Clone)]
pub struct FrameSink {
    frame_tx: Sender<Job>,
    flags: Arc<SharedFlags>,
}

impl FrameSink {
    /// Queues one captured buffer for processing.
    ///
    /// Only the first `frame_count` samples are used. Never blocks; the
    /// buffer is dropped when the engine is stopped or the queue is full.
    ///
    /// # Returns
    /// * `true` - The frame was queued
    /// * `false` - The frame was dropped
    pub fn deliver_buffer(&self, samples: &[f32], sample_rate: f32, frame_count: usize) -> bool {
        if !self.flags.running.load(Ordering::SeqCst) {
            return false;
        }
        let frame_count = frame_count.min(samples.len());
        self.deliver(AudioFrame::new(samples[..frame_count].to_vec(), sample_rate))
    }

    /// Queues an owned frame for processing. See [`FrameSink::deliver_buffer`].
    pub fn deliver(&self, frame: AudioFrame) -> bool {
        if !self.flags.running.load(Ordering::SeqCst) {
            return false;
        }
        // Generation first, then the clock: `start` resets the clock before
        // bumping the generation, so a frame tagged with a new generation
        // always carries an offset from the new run.
        let generation = self.flags.generation.load(Ordering::SeqCst);
        let Some(length) = frame.duration() else {
            debug!(sample_rate = frame.sample_rate, "implausible sample rate, dropping buffer");
            return false;
        };
        let length = u64::try_from(length.as_nanos()).unwrap_or(u64::MAX);
        let offset = self
            .flags
            .stream_nanos
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |nanos| {
                Some(nanos.saturating_add(length))
            })
            .unwrap_or_else(|nanos| nanos);

        let job = Job {
            generation,
            stream_offset: Duration::from_nanos(offset.saturating_add(length)),
            frame,
        };
        self.flags.in_flight.fetch_add(1, Ordering::SeqCst);
        match self.frame_tx.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.flags.in_flight.fetch_sub(1, Ordering::SeqCst);
                trace!("frame queue full, dropping buffer");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.flags.in_flight.fetch_sub(1, Ordering::SeqCst);
                trace!("processing worker gone, dropping buffer");
                false
            }
        }
    }
}

/// Mutable state owned by the observation context.
struct EngineState {
    session: TuningSession,
    current_frequency: Option<f32>,
    run_started_at: Instant,
}

/// Processing worker thread management.
struct Worker {
    shutdown_tx: Sender<()>,
    thread_handle: Option<JoinHandle<()>>,
}

/// The tuner: detector, session and processing worker behind one handle.
pub struct TunerEngine {
    config: TunerConfig,
    detector: Arc<PitchDetector>,
    flags: Arc<SharedFlags>,
    sink: FrameSink,
    estimate_rx: Receiver<Estimate>,
    state: Mutex<EngineState>,
    subscribers: Mutex<Vec<Sender<TunerUpdate>>>,
    worker: Option<Worker>,
}

impl TunerEngine {
    /// Creates an engine and spawns its processing worker.
    pub fn new(config: TunerConfig) -> TunerResult<Self> {
        config.validate()?;

        let detector = Arc::new(PitchDetector::new(config.detector.clone()));
        let flags = Arc::new(SharedFlags::default());
        let (frame_tx, frame_rx) = crossbeam_channel::bounded::<Job>(FRAME_QUEUE_CAPACITY);
        let (estimate_tx, estimate_rx) = crossbeam_channel::unbounded::<Estimate>();
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);

        let worker_detector = detector.clone();
        let thread_handle = thread::Builder::new()
            .name("tuner-processing".into())
            .spawn(move || run_worker(worker_detector, frame_rx, estimate_tx, shutdown_rx))
            .map_err(TunerError::WorkerSpawn)?;

        let session = TuningSession::new(detector.clone(), config.session.clone());
        info!(buffer_size = config.buffer_size, "tuner engine created");

        Ok(Self {
            config,
            detector,
            sink: FrameSink {
                frame_tx,
                flags: flags.clone(),
            },
            flags,
            estimate_rx,
            state: Mutex::new(EngineState {
                session,
                current_frequency: None,
                run_started_at: Instant::now(),
            }),
            subscribers: Mutex::new(Vec::new()),
            worker: Some(Worker {
                shutdown_tx,
                thread_handle: Some(thread_handle),
            }),
        })
    }

    pub fn config(&self) -> &TunerConfig {
        &self.config
    }

    pub fn detector(&self) -> &Arc<PitchDetector> {
        &self.detector
    }

    /// A handle the capture callback can own.
    pub fn frame_sink(&self) -> FrameSink {
        self.sink.clone()
    }

    /// Queues one captured buffer. See [`FrameSink::deliver_buffer`].
    pub fn deliver_buffer(&self, samples: &[f32], sample_rate: f32, frame_count: usize) -> bool {
        self.sink.deliver_buffer(samples, sample_rate, frame_count)
    }

    /// Registers a new observer. Updates are sent until the receiver is dropped.
    pub fn subscribe(&self) -> Receiver<TunerUpdate> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn is_running(&self) -> bool {
        self.flags.running.load(Ordering::SeqCst)
    }

    /// Frames accepted by the sink whose estimates `pump` has not drained yet.
    pub fn pending_frames(&self) -> usize {
        self.flags.in_flight.load(Ordering::SeqCst)
    }

    /// Selects an instrument by catalog id.
    ///
    /// An unknown id leaves the session untouched and is reported to the caller.
    pub fn select_instrument(&self, id: &str) -> TunerResult<()> {
        let instrument = Instrument::from_id(id).inspect_err(|e| warn!("{}", e))?;
        self.select(instrument);
        Ok(())
    }

    /// Selects an instrument, resetting progress to its first string.
    pub fn select(&self, instrument: Instrument) {
        let mut state = self.state.lock();
        // Estimates computed against the previous target are stale.
        self.flags.generation.fetch_add(1, Ordering::SeqCst);
        state.current_frequency = None;
        let events = state.session.select_instrument(instrument);
        self.publish_events(events);
    }

    /// Starts a run on the selected instrument.
    ///
    /// A no-op while a run is in progress or when no instrument is selected.
    /// After a completed run this begins a fresh one at the first string.
    ///
    /// # Returns
    /// * `Err(TunerError::WorkerGone)` - The engine was shut down or its worker exited
    pub fn start(&self) -> TunerResult<()> {
        if !self.worker_alive() {
            error!("cannot start, processing worker has exited");
            return Err(TunerError::WorkerGone);
        }

        let mut state = self.state.lock();
        let was_running = self.flags.running.load(Ordering::SeqCst);
        if was_running && state.session.is_running() {
            debug!("start ignored, engine already running");
            return Ok(());
        }
        if state.session.instrument().is_none() {
            warn!("start ignored, no instrument selected");
            return Ok(());
        }

        self.flags.stream_nanos.store(0, Ordering::SeqCst);
        self.flags.generation.fetch_add(1, Ordering::SeqCst);
        state.run_started_at = Instant::now();
        state.current_frequency = None;
        let events = state.session.start();
        self.flags.running.store(true, Ordering::SeqCst);

        if !was_running {
            self.publish(TunerUpdate::Running(true));
        }
        self.publish_events(events);
        Ok(())
    }

    /// Stops the run. Idempotent.
    ///
    /// Once this returns, no estimate from the stopped run will be acted upon.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if !self.flags.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.flags.generation.fetch_add(1, Ordering::SeqCst);
        state.current_frequency = None;
        let events = state.session.stop();

        self.publish(TunerUpdate::Running(false));
        self.publish(TunerUpdate::Frequency(None));
        self.publish_events(events);
    }

    /// Applies every finished estimate, in processing order.
    ///
    /// Call this from the observation context. Estimates from a previous run
    /// or arriving after `stop` are discarded.
    ///
    /// # Returns
    /// * The session events produced by the applied estimates
    pub fn pump(&self) -> Vec<SessionEvent> {
        let mut produced = Vec::new();
        let mut state = self.state.lock();

        for estimate in self.estimate_rx.try_iter() {
            self.flags.in_flight.fetch_sub(1, Ordering::SeqCst);
            let generation = self.flags.generation.load(Ordering::SeqCst);
            if !self.flags.running.load(Ordering::SeqCst) || estimate.generation != generation {
                trace!(
                    estimate_generation = estimate.generation,
                    generation,
                    "discarding stale estimate"
                );
                continue;
            }

            if state.current_frequency != estimate.frequency {
                state.current_frequency = estimate.frequency;
                self.publish(TunerUpdate::Frequency(estimate.frequency));
            }

            let now = state.run_started_at + estimate.stream_offset;
            let events = state.session.on_frequency_estimate(estimate.frequency, now);
            self.publish_events(events.iter().cloned());
            produced.extend(events);
        }
        produced
    }

    pub fn snapshot(&self) -> TunerSnapshot {
        let state = self.state.lock();
        let session = &state.session;
        let current = session.current_string();
        TunerSnapshot {
            is_running: self.is_running(),
            instrument: session.instrument(),
            current_frequency: state.current_frequency,
            current_string_index: session.current_string_index(),
            current_note: current.map(|s| s.note),
            target_frequency: current.map(|s| s.target),
            tuned_strings: session.tuned_strings().clone(),
            session_complete: session.is_complete(),
        }
    }

    /// Stops the run, signals the processing worker and waits for it to exit.
    ///
    /// Idempotent. Afterwards the sink drops every buffer and `start` returns
    /// [`TunerError::WorkerGone`].
    pub fn shutdown(&mut self) {
        self.stop();
        let Some(mut worker) = self.worker.take() else {
            return;
        };
        let _ = worker.shutdown_tx.send(());
        if let Some(handle) = worker.thread_handle.take()
            && handle.join().is_err()
        {
            error!("processing worker panicked during shutdown");
        }
        debug!("tuner engine shut down");
    }

    fn worker_alive(&self) -> bool {
        self.worker
            .as_ref()
            .and_then(|w| w.thread_handle.as_ref())
            .is_some_and(|h| !h.is_finished())
    }

    fn publish_events(&self, events: impl IntoIterator<Item = SessionEvent>) {
        for event in events {
            self.publish(TunerUpdate::Session(event));
        }
    }

    fn publish(&self, update: TunerUpdate) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(update.clone()).is_ok());
    }
}

impl Drop for TunerEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Processing loop: one frame at a time, in arrival order.
fn run_worker(
    detector: Arc<PitchDetector>,
    frame_rx: Receiver<Job>,
    estimate_tx: Sender<Estimate>,
    shutdown_rx: Receiver<()>,
) {
    debug!("processing worker started");
    loop {
        crossbeam_channel::select! {
            recv(frame_rx) -> msg => match msg {
                Ok(job) => {
                    // A bad buffer must not take the loop down with it.
                    let frequency = panic::catch_unwind(AssertUnwindSafe(|| {
                        detector.process(&job.frame.samples, job.frame.sample_rate)
                    }))
                    .unwrap_or_else(|_| {
                        error!(frame_count = job.frame.frame_count(), "pitch detection panicked");
                        None
                    });

                    let estimate = Estimate {
                        generation: job.generation,
                        stream_offset: job.stream_offset,
                        frequency,
                    };
                    if estimate_tx.send(estimate).is_err() {
                        debug!("estimate receiver dropped");
                        break;
                    }
                }
                Err(_) => {
                    debug!("frame channel closed");
                    break;
                }
            },
            recv(shutdown_rx) -> _ => {
                debug!("processing worker received shutdown signal");
                break;
            },
        }
    }
    debug!("processing worker finished");
}
