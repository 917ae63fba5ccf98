//! # Tuner - Guided Instrument Tuning from the Terminal
//!
//! Console front-end for the tuner core. It opens the default microphone,
//! walks the user through every string of the chosen instrument and prints
//! a one-line readout of the detected frequency.
//!
//! ## Architecture
//! - **Capture**: CPAL callback slicing audio into frames for the engine
//! - **Processing**: the engine's dedicated worker thread
//! - **Main Thread**: pumps estimates every 16 ms and renders the readout
//! - **Communication**: Crossbeam channels between all three

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use cpal::traits::StreamTrait;
use crossbeam_channel::Receiver;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tuner_core::{
    Instrument, SessionEvent, TunerConfig, TunerEngine, TunerSnapshot, TunerUpdate, audio,
};

/// Interval between pumps of the engine's finished estimates.
const PUMP_INTERVAL: Duration = Duration::from_millis(16);

#[derive(Debug, Parser)]
#[command(name = "tuner", version, about = "Tune an instrument string by string")]
struct Args {
    /// Instrument to tune (guitar, bass)
    #[arg(short, long, default_value = "guitar", value_parser = Instrument::from_id)]
    instrument: Instrument,

    /// JSON file overriding detector and session parameters
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Samples per analysis frame
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Print the instrument catalog and exit
    #[arg(long)]
    list: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    if args.list {
        print_catalog();
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => TunerConfig::load(path)?,
        None => TunerConfig::default(),
    };
    if let Some(buffer_size) = args.buffer_size {
        config.buffer_size = buffer_size;
    }

    let mut engine = TunerEngine::new(config)?;
    let updates = engine.subscribe();
    engine.select(args.instrument);

    let (stream, sample_rate) =
        audio::start_audio_capture(engine.frame_sink(), engine.config().buffer_size)
            .context("starting audio capture")?;
    engine.start()?;
    info!(instrument = %args.instrument, sample_rate, "tuning started, press Enter to stop");

    let stop_rx = spawn_stdin_watcher();
    let ticker = crossbeam_channel::tick(PUMP_INTERVAL);

    loop {
        crossbeam_channel::select! {
            recv(ticker) -> _ => {
                engine.pump();
            },
            recv(updates) -> msg => match msg {
                Ok(update) => report(&update, &engine.snapshot()),
                Err(_) => break,
            },
            recv(stop_rx) -> _ => {
                info!("stop requested");
                break;
            },
        }

        if engine.snapshot().session_complete {
            // Let the remaining updates print before leaving.
            for update in updates.try_iter() {
                report(&update, &engine.snapshot());
            }
            break;
        }
    }

    engine.shutdown();
    if let Err(e) = stream.pause() {
        warn!("error pausing stream: {}", e);
    }
    drop(stream);
    println!();
    Ok(())
}

/// Prints every instrument and its strings in tuning order.
fn print_catalog() {
    for instrument in Instrument::ALL {
        println!("{} ({})", instrument.display_name(), instrument.id());
        for (index, string) in instrument.strings().iter().enumerate() {
            println!("  {}. {:<3} {:>7.2} Hz", index + 1, string.note, string.target);
        }
    }
}

/// Signals once the user presses Enter or stdin closes.
fn spawn_stdin_watcher() -> Receiver<()> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    thread::spawn(move || {
        let mut line = String::new();
        let _ = io::stdin().lock().read_line(&mut line);
        let _ = tx.send(());
    });
    rx
}

/// Renders one update from the engine.
fn report(update: &TunerUpdate, snapshot: &TunerSnapshot) {
    match update {
        TunerUpdate::Frequency(_) => print_readout(snapshot),
        TunerUpdate::Running(running) => info!(running, "engine state changed"),
        TunerUpdate::Session(event) => match event {
            SessionEvent::Started { target, .. } | SessionEvent::Advanced { target, .. } => {
                println!();
                println!(
                    "Play string {} ({:.2} Hz)",
                    snapshot.current_note.unwrap_or("?"),
                    target
                );
            }
            SessionEvent::StringTuned { note, .. } => {
                println!();
                println!("{} tuned", note);
            }
            SessionEvent::Completed => {
                println!();
                println!("All strings tuned!");
            }
            _ => {}
        },
    }
}

fn print_readout(snapshot: &TunerSnapshot) {
    let string_count = snapshot.instrument.map_or(0, |i| i.strings().len());
    let reading = match (snapshot.current_frequency, snapshot.cents_deviation()) {
        (Some(freq), Some(cents)) => format!("{:>7.2} Hz {:>+6.1} cents", freq, cents),
        _ => "Detecting...".to_string(),
    };
    print!(
        "\r[{} {}/{}] {:<28}",
        snapshot.current_note.unwrap_or("-"),
        snapshot.tuned_strings.len(),
        string_count,
        reading
    );
    let _ = io::stdout().flush();
}
