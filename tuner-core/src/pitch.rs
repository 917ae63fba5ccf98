//! # Pitch Detection Module
//!
//! This module implements the time-domain pitch detector used by the tuner.
//! It estimates the fundamental frequency of a single monophonic buffer with
//! normalized autocorrelation, and can narrow its search to the string
//! currently being tuned.
//!
//! ## Features
//! - RMS noise gate to filter out silence and room noise
//! - Normalized autocorrelation over a bounded lag range
//! - Target-frequency narrowing to prevent octave errors on low strings
//! - Confidence gate to reject ambiguous signals
//! - Period refinement with parabolic interpolation for sub-sample accuracy
//!
//! ## Concurrency
//! The detector keeps no state between buffers apart from the target
//! frequency, which is held in an atomic. `set_target` may be called from any
//! thread while `process` runs on another; a call to `process` reads the target
//! exactly once and sees either the old or the new value.

use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{debug, trace};

use crate::config::DetectorConfig;

/// Guards the normalization against an all-zero buffer.
const ENERGY_EPSILON: f32 = 1e-9;

/// Bit pattern stored when no target is set (`0.0_f32`).
const NO_TARGET: u32 = 0;

/// Autocorrelation pitch detector with an optional target hint.
#[derive(Debug)]
pub struct PitchDetector {
    config: DetectorConfig,
    /// Target frequency as `f32` bits; `NO_TARGET` when absent.
    target_bits: AtomicU32,
}

impl Default for PitchDetector {
    fn default() -> Self {
        Self::new(DetectorConfig::default())
    }
}

impl PitchDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            target_bits: AtomicU32::new(NO_TARGET),
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Sets or clears the frequency the search window is centred on.
    ///
    /// Non-positive and non-finite values clear the target.
    pub fn set_target(&self, target: Option<f32>) {
        let bits = match target {
            Some(t) if t.is_finite() && t > 0.0 => t.to_bits(),
            _ => NO_TARGET,
        };
        self.target_bits.store(bits, Ordering::Release);
        trace!(target_hz = ?self.target(), "detector target updated");
    }

    /// Returns the current target frequency, if any.
    pub fn target(&self) -> Option<f32> {
        match self.target_bits.load(Ordering::Acquire) {
            NO_TARGET => None,
            bits => Some(f32::from_bits(bits)),
        }
    }

    /// Estimates the fundamental frequency of one buffer.
    ///
    /// This function:
    /// 1. Rejects buffers whose RMS is below the silence threshold
    /// 2. Selects the lag range, narrowed around the target when one is set
    /// 3. Computes the autocorrelation normalized by the buffer energy
    /// 4. Picks the strongest local peak and applies the confidence gate
    /// 5. Converts the (optionally refined) lag to Hz
    ///
    /// # Arguments
    /// * `samples` - Mono audio samples, normalized to [-1, 1]
    /// * `sample_rate` - Sample rate in Hz
    ///
    /// # Returns
    /// * `Some(frequency)` - Detected frequency in Hz
    /// * `None` - Silence, no periodic signal, or invalid input
    pub fn process(&self, samples: &[f32], sample_rate: f32) -> Option<f32> {
        if samples.is_empty() {
            return None;
        }
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            debug!(sample_rate, "ignoring buffer with invalid sample rate");
            return None;
        }

        // --- Noise Gate ---
        let level = rms(samples);
        if level < self.config.silence_rms_threshold {
            trace!(rms = level, "buffer below silence threshold");
            return None;
        }

        // --- Search Range ---
        let target = self.target();
        let (min_lag, max_lag) = self.lag_range(sample_rate, samples.len(), target)?;

        // Correlations are computed one lag beyond each end of the range so
        // every candidate has both neighbours for the peak test.
        let lo = min_lag.saturating_sub(1).max(1);
        let hi = (max_lag + 1).min(samples.len() - 1);
        if hi < lo + 2 {
            return None;
        }

        let energy: f32 = samples.iter().map(|&s| s * s).sum();
        let norm = 1.0 / (energy + ENERGY_EPSILON);
        let correlation: Vec<f32> = (lo..=hi)
            .map(|lag| autocorrelation(samples, lag) * norm)
            .collect();
        let at = |lag: usize| correlation[lag - lo];

        // --- Peak Picking ---
        // Only local maxima are candidates. The slope falling away from lag 0
        // is never a peak, which keeps short lags from winning on low notes.
        let mut best: Option<(usize, f32)> = None;
        for lag in min_lag.max(lo + 1)..=max_lag.min(hi - 1) {
            let c = at(lag);
            let is_peak = c > at(lag - 1) && c >= at(lag + 1);
            if is_peak && best.is_none_or(|(_, best_c)| c > best_c) {
                best = Some((lag, c));
            }
        }

        let Some((lag, confidence)) = best else {
            trace!(min_lag, max_lag, "no correlation peak in range");
            return None;
        };

        // --- Confidence Gate ---
        if confidence < self.config.confidence_threshold {
            trace!(confidence, lag, "correlation peak below confidence threshold");
            return None;
        }

        // --- Conversion ---
        let period = if self.config.refine_period {
            refine_period(samples, lag, min_lag, max_lag)
        } else {
            lag as f32
        };

        let frequency = sample_rate / period;
        if frequency.is_finite() && frequency > 0.0 {
            trace!(frequency, confidence, lag, ?target, "pitch detected");
            Some(frequency)
        } else {
            None
        }
    }

    /// Computes the inclusive lag range searched for a buffer.
    ///
    /// Without a target the range covers `min_frequency..=max_frequency`.
    /// With a target `T` it covers `T·(1 - w)..=T·(1 + w)` where `w` is the
    /// target window. The longest lag never exceeds half the buffer.
    ///
    /// # Returns
    /// * `Some((min_lag, max_lag))` - Lags in samples, `min_lag >= 1`
    /// * `None` - The range is empty for this buffer length
    pub fn lag_range(
        &self,
        sample_rate: f32,
        frame_len: usize,
        target: Option<f32>,
    ) -> Option<(usize, usize)> {
        let (low_hz, high_hz) = match target {
            Some(t) => (
                t * (1.0 - self.config.target_window),
                t * (1.0 + self.config.target_window),
            ),
            None => (self.config.min_frequency, self.config.max_frequency),
        };

        let min_lag = ((sample_rate / high_hz).floor() as usize).max(1);
        let max_lag = ((sample_rate / low_hz).ceil() as usize).min(frame_len / 2);

        if min_lag > max_lag {
            trace!(min_lag, max_lag, frame_len, "empty lag range");
            None
        } else {
            Some((min_lag, max_lag))
        }
    }
}

/// Root-mean-square amplitude of a buffer. Zero for an empty buffer.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|&s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
}

/// Raw autocorrelation at `lag` over the overlapping part of the buffer.
fn autocorrelation(samples: &[f32], lag: usize) -> f32 {
    samples
        .iter()
        .zip(&samples[lag..])
        .map(|(&a, &b)| a * b)
        .sum()
}

/// Autocorrelation divided by the number of overlapping samples.
fn overlap_normalized(samples: &[f32], lag: usize) -> f32 {
    autocorrelation(samples, lag) / (samples.len() - lag) as f32
}

/// Refines a peak lag to a fractional period.
///
/// Dividing by the total buffer energy shrinks the correlation linearly with
/// the lag, which pulls peaks toward shorter lags. The peak is first moved
/// to the local maximum of the overlap-normalized correlation within
/// `min_lag..=max_lag`, then a parabola through it and its neighbours gives
/// the sub-sample vertex.
fn refine_period(samples: &[f32], lag: usize, min_lag: usize, max_lag: usize) -> f32 {
    let mut best = lag;
    let mut best_value = overlap_normalized(samples, best);
    loop {
        if best < max_lag {
            let value = overlap_normalized(samples, best + 1);
            if value > best_value {
                best += 1;
                best_value = value;
                continue;
            }
        }
        if best > min_lag {
            let value = overlap_normalized(samples, best - 1);
            if value > best_value {
                best -= 1;
                best_value = value;
                continue;
            }
        }
        break;
    }

    if best < 2 || best + 1 >= samples.len() {
        return best as f32;
    }

    let y1 = overlap_normalized(samples, best - 1);
    let y3 = overlap_normalized(samples, best + 1);
    let denominator = y1 - 2.0 * best_value + y3;
    if denominator.abs() < 1e-12 {
        return best as f32;
    }
    let shift = (0.5 * (y1 - y3) / denominator).clamp(-0.5, 0.5);
    best as f32 + shift
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    const SAMPLE_RATE: f32 = 44100.0;
    const FRAME: usize = 4096;

    fn sine(freq: f32, amplitude: f32) -> Vec<f32> {
        (0..FRAME)
            .map(|i| amplitude * (2.0 * PI * freq * i as f32 / SAMPLE_RATE).sin())
            .collect()
    }

    fn mix(a: &[f32], b: &[f32]) -> Vec<f32> {
        a.iter().zip(b).map(|(x, y)| x + y).collect()
    }

    /// Deterministic uniform noise in [-amplitude, amplitude].
    fn noise(amplitude: f32, seed: u32) -> Vec<f32> {
        let mut state = seed;
        (0..FRAME)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                let unit = (state >> 8) as f32 / (1u32 << 24) as f32;
                amplitude * (2.0 * unit - 1.0)
            })
            .collect()
    }

    fn assert_close(actual: f32, expected: f32, rel: f32) {
        assert!(
            (actual - expected).abs() <= expected * rel,
            "Expected ~{}Hz, got {}Hz",
            expected,
            actual
        );
    }

    #[test]
    fn test_silence_never_yields_pitch() {
        let detector = PitchDetector::default();
        assert_eq!(detector.process(&vec![0.0; FRAME], SAMPLE_RATE), None);

        for threshold in [0.01, 0.02, 0.05] {
            let detector = PitchDetector::new(DetectorConfig {
                silence_rms_threshold: threshold,
                ..DetectorConfig::default()
            });
            // A sine's RMS is amplitude / sqrt(2); keep it at half the gate.
            let quiet = sine(110.0, threshold * 0.5 * 2f32.sqrt());
            assert!(rms(&quiet) < threshold);
            assert_eq!(detector.process(&quiet, SAMPLE_RATE), None);
        }
    }

    #[test]
    fn test_pure_sines_are_detected() {
        let detector = PitchDetector::default();
        for freq in [41.2, 82.41, 110.0, 196.0, 329.63] {
            let estimate = detector
                .process(&sine(freq, 0.5), SAMPLE_RATE)
                .unwrap_or_else(|| panic!("no estimate for {}Hz", freq));
            assert_close(estimate, freq, 0.01);
        }
    }

    #[test]
    fn test_pure_sines_without_refinement() {
        let detector = PitchDetector::new(DetectorConfig {
            refine_period: false,
            ..DetectorConfig::default()
        });
        // The lowest bass string needs refinement to stay inside 1%.
        for freq in [82.41, 110.0, 196.0, 329.63] {
            let estimate = detector.process(&sine(freq, 0.5), SAMPLE_RATE).unwrap();
            assert_close(estimate, freq, 0.01);
        }
    }

    #[test]
    fn test_refinement_improves_precision() {
        let detector = PitchDetector::default();
        let estimate = detector.process(&sine(329.63, 0.5), SAMPLE_RATE).unwrap();
        // Integer lag 134 alone would give 329.10 Hz.
        assert!((estimate - 329.63).abs() < 0.3, "got {}Hz", estimate);

        let estimate = detector.process(&sine(41.2, 0.5), SAMPLE_RATE).unwrap();
        assert!((estimate - 41.2).abs() < 0.2, "got {}Hz", estimate);
    }

    #[test]
    fn test_target_keeps_detection_accurate() {
        let detector = PitchDetector::default();
        for freq in [41.2, 82.41, 110.0, 196.0, 329.63] {
            detector.set_target(Some(freq));
            let estimate = detector.process(&sine(freq, 0.5), SAMPLE_RATE).unwrap();
            assert_close(estimate, freq, 0.01);
        }
    }

    #[test]
    fn test_target_prefers_fundamental_over_stronger_harmonic() {
        // Weak E1 fundamental under a dominant third harmonic.
        let buffer = mix(&sine(41.2, 0.3), &sine(123.6, 1.0));
        let detector = PitchDetector::default();

        let unconstrained = detector.process(&buffer, SAMPLE_RATE).unwrap();
        assert_close(unconstrained, 123.6, 0.01);

        detector.set_target(Some(41.2));
        let narrowed = detector.process(&buffer, SAMPLE_RATE).unwrap();
        assert_close(narrowed, 41.2, 0.01);
    }

    #[test]
    fn test_noise_is_rejected() {
        let detector = PitchDetector::default();
        for seed in [1, 7, 42] {
            let buffer = noise(0.5, seed);
            assert!(rms(&buffer) > 0.02);
            assert_eq!(detector.process(&buffer, SAMPLE_RATE), None);
        }
    }

    #[test]
    fn test_invalid_input_yields_no_estimate() {
        let detector = PitchDetector::default();
        let buffer = sine(110.0, 0.5);
        assert_eq!(detector.process(&[], SAMPLE_RATE), None);
        assert_eq!(detector.process(&buffer, 0.0), None);
        assert_eq!(detector.process(&buffer, -44100.0), None);
        assert_eq!(detector.process(&buffer, f32::NAN), None);
        assert_eq!(detector.process(&buffer[..3], SAMPLE_RATE), None);
    }

    #[test]
    fn test_non_positive_target_is_absent() {
        let detector = PitchDetector::default();
        detector.set_target(Some(110.0));
        assert_eq!(detector.target(), Some(110.0));
        detector.set_target(Some(0.0));
        assert_eq!(detector.target(), None);
        detector.set_target(Some(-5.0));
        assert_eq!(detector.target(), None);
        detector.set_target(Some(f32::INFINITY));
        assert_eq!(detector.target(), None);
    }

    #[test]
    fn test_lag_range() {
        let detector = PitchDetector::default();
        assert_eq!(detector.lag_range(SAMPLE_RATE, FRAME, None), Some((110, 1470)));

        // Short buffers cap the longest lag at half the frame.
        assert_eq!(detector.lag_range(SAMPLE_RATE, 1024, None), Some((110, 512)));

        let (min_lag, max_lag) = detector.lag_range(SAMPLE_RATE, FRAME, Some(110.0)).unwrap();
        assert_eq!(min_lag, 364);
        assert_eq!(max_lag, 446);

        assert_eq!(detector.lag_range(SAMPLE_RATE, 64, Some(41.2)), None);
    }

    #[test]
    fn test_confidence_threshold_range() {
        // The threshold is empirical; a clean tone passes anywhere in a plausible range.
        for threshold in [0.1, 0.2, 0.3, 0.5] {
            let detector = PitchDetector::new(DetectorConfig {
                confidence_threshold: threshold,
                ..DetectorConfig::default()
            });
            let estimate = detector.process(&sine(110.0, 0.5), SAMPLE_RATE).unwrap();
            assert_close(estimate, 110.0, 0.01);
        }
    }

    #[test]
    fn test_concurrent_target_updates() {
        let detector = PitchDetector::default();
        let buffer = sine(82.41, 0.5);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for i in 0..200 {
                    let target = if i % 2 == 0 { Some(82.41) } else { None };
                    detector.set_target(target);
                }
            });
            for _ in 0..10 {
                let estimate = detector.process(&buffer, SAMPLE_RATE).unwrap();
                assert_close(estimate, 82.41, 0.01);
            }
        });
    }
}
