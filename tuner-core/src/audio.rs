//! # Audio Capture Module
//!
//! This module handles real-time audio capture using CPAL (Cross-Platform Audio Library).
//! It opens the default input device, slices the incoming stream into fixed-size
//! mono frames and hands them to the engine's [`FrameSink`].
//!
//! ## Features
//! - Automatic audio device selection
//! - Prefers mono 32-bit float near 44.1 kHz, downmixes anything wider
//! - Fixed-size frame accumulation independent of the device's callback size
//! - Never blocks the audio callback

use anyhow::{Context, Result};
use cpal::SupportedStreamConfigRange;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::{error, info};

use crate::engine::{AudioFrame, FrameSink};
use crate::error::TunerError;

/// Sample rate requested from the device when it supports it.
pub const TARGET_SAMPLE_RATE: u32 = 44100;

/// Accumulates interleaved callback data into fixed-size mono frames.
#[derive(Debug)]
pub struct FrameAccumulator {
    buffer: Vec<f32>,
    frame_size: usize,
    channels: usize,
}

impl FrameAccumulator {
    pub fn new(frame_size: usize, channels: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(frame_size * 2),
            frame_size: frame_size.max(1),
            channels: channels.max(1),
        }
    }

    /// Appends interleaved samples and emits every complete frame.
    pub fn push(&mut self, data: &[f32], mut emit: impl FnMut(&[f32])) {
        if self.channels == 1 {
            self.buffer.extend_from_slice(data);
        } else {
            let channels = self.channels;
            self.buffer.extend(
                data.chunks_exact(channels)
                    .map(|frame| frame.iter().sum::<f32>() / channels as f32),
            );
        }

        // While we have enough data for a full frame, process it.
        while self.buffer.len() >= self.frame_size {
            emit(&self.buffer[..self.frame_size]);
            self.buffer.drain(..self.frame_size);
        }
    }

    /// Samples waiting for the next frame to fill.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Starts audio capture from the default input device.
///
/// This function:
/// 1. Selects the default audio input device
/// 2. Picks an f32 configuration, mono if possible, as close to 44.1 kHz as allowed
/// 3. Sets up a callback that delivers `buffer_size`-sample frames to `sink`
///
/// # Arguments
/// * `sink` - Frame sink of the engine that processes the audio
/// * `buffer_size` - Samples per delivered frame
///
/// # Returns
/// * `Ok((stream, sample_rate))` - Audio stream handle and sample rate
/// * `Err(e)` - Error if audio setup fails
pub fn start_audio_capture(sink: FrameSink, buffer_size: usize) -> Result<(cpal::Stream, u32)> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or(TunerError::NoInputDevice)?;

    info!(device = %device.name().unwrap_or_else(|_| "<unknown>".into()), "using audio input device");

    let configs = device
        .supported_input_configs()
        .context("querying supported input configs")?
        .collect::<Vec<_>>();
    let supported_config =
        find_supported_config(configs, TARGET_SAMPLE_RATE).ok_or(TunerError::UnsupportedInputFormat)?;

    let rate = TARGET_SAMPLE_RATE.clamp(
        supported_config.min_sample_rate().0,
        supported_config.max_sample_rate().0,
    );
    let channels = supported_config.channels() as usize;
    let config: cpal::StreamConfig = supported_config
        .with_sample_rate(cpal::SampleRate(rate))
        .into();

    info!(sample_rate = rate, channels, buffer_size, "input stream configured");

    let err_fn = |err| error!("an error occurred on the audio stream: {}", err);

    let mut accumulator = FrameAccumulator::new(buffer_size, channels);
    let sample_rate = rate as f32;

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                accumulator.push(data, |frame| {
                    // Dropped frames are fine; the next one supersedes them.
                    sink.deliver(AudioFrame::new(frame.to_vec(), sample_rate));
                });
            },
            err_fn,
            None,
        )
        .context("building input stream")?;

    stream.play().context("starting input stream")?;

    Ok((stream, rate))
}

/// Finds the best supported audio configuration for the target sample rate.
///
/// Only 32-bit float formats are considered. Mono configurations win over
/// multi-channel ones; ties go to the range closest to `target_rate`.
fn find_supported_config(
    configs: Vec<SupportedStreamConfigRange>,
    target_rate: u32,
) -> Option<SupportedStreamConfigRange> {
    configs
        .into_iter()
        .filter(|c| c.sample_format() == cpal::SampleFormat::F32)
        .min_by_key(|c| {
            let min = c.min_sample_rate().0;
            let max = c.max_sample_rate().0;
            let distance = if (min..=max).contains(&target_rate) {
                0
            } else {
                min.abs_diff(target_rate).min(max.abs_diff(target_rate))
            };
            (c.channels() != 1, distance)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpal::{SampleFormat, SampleRate, SupportedBufferSize};

    fn range(channels: u16, min: u32, max: u32, format: SampleFormat) -> SupportedStreamConfigRange {
        SupportedStreamConfigRange::new(
            channels,
            SampleRate(min),
            SampleRate(max),
            SupportedBufferSize::Unknown,
            format,
        )
    }

    #[test]
    fn test_accumulator_emits_fixed_frames() {
        let mut acc = FrameAccumulator::new(4, 1);
        let mut frames = Vec::new();
        acc.push(&[1.0, 2.0, 3.0], |f| frames.push(f.to_vec()));
        assert!(frames.is_empty());
        acc.push(&[4.0, 5.0, 6.0, 7.0, 8.0, 9.0], |f| frames.push(f.to_vec()));
        assert_eq!(frames, vec![vec![1.0, 2.0, 3.0, 4.0], vec![5.0, 6.0, 7.0, 8.0]]);
        assert_eq!(acc.buffered(), 1);
    }

    #[test]
    fn test_accumulator_downmixes() {
        let mut acc = FrameAccumulator::new(2, 2);
        let mut frames = Vec::new();
        acc.push(&[1.0, 0.0, 0.5, 0.5], |f| frames.push(f.to_vec()));
        assert_eq!(frames, vec![vec![0.5, 0.5]]);
    }

    #[test]
    fn test_prefers_mono_float_config() {
        let configs = vec![
            range(2, 44100, 48000, SampleFormat::F32),
            range(1, 44100, 44100, SampleFormat::I16),
            range(1, 8000, 96000, SampleFormat::F32),
        ];
        let chosen = find_supported_config(configs, 44100).unwrap();
        assert_eq!(chosen.channels(), 1);
        assert_eq!(chosen.sample_format(), SampleFormat::F32);
    }

    #[test]
    fn test_falls_back_to_stereo() {
        let configs = vec![
            range(1, 44100, 44100, SampleFormat::I16),
            range(2, 48000, 48000, SampleFormat::F32),
        ];
        let chosen = find_supported_config(configs, 44100).unwrap();
        assert_eq!(chosen.channels(), 2);
        assert!(find_supported_config(vec![range(1, 44100, 44100, SampleFormat::I16)], 44100).is_none());
    }
}
