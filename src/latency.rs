//! System-latency calibration
//!
//! The fixed electronic/driver delay between "samples handed to the
//! output stream" and "the same sound arriving back on the input stream"
//! has to be known before any distance can be trusted. The calibrator
//! measures it with a short loopback protocol: a silent warm-up job, a
//! burst of repeated chirp cycles with the first few discarded, and an
//! outlier-robust aggregation of the per-cycle lags.

use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::{ChirpSpec, StreamConfig};
use crate::dsp::chirp::{generate_chirp, MIN_REFERENCE_FADE};
use crate::dsp::correlation::{correlate, parabolic_interpolate};
use crate::dsp::peaks::CalibrationPolicy;
use crate::error::{RangingError, ValidationError};
use crate::ranging::RangingEngine;

/// Samples farther than this many MADs from the median are outliers.
const OUTLIER_K: f64 = 3.5;

/// Scheduling guard added to the minimum wall-clock period per cycle.
const CYCLE_GUARD_S: f64 = 0.05;

/// Latencies outside this range indicate a broken loopback path rather
/// than a real calibration, and should not be persisted automatically.
const PLAUSIBLE_LATENCY_S: std::ops::RangeInclusive<f64> = 0.0005..=0.01;

/// Result of one calibration run.
#[derive(Debug, Clone, Serialize)]
pub struct LatencyEstimate {
    /// Median of the inlier latencies, seconds
    pub latency_s: f64,
    /// Standard deviation of the inliers, a stability indicator
    pub latency_std_s: f64,
    /// `latency_s` expressed in samples
    pub lag_samples: f64,
    /// Every kept cycle's latency, before outlier filtering
    pub raw_latencies_s: Vec<f64>,
    /// Inlier subset the final value was computed from
    pub used_latencies_s: Vec<f64>,
    pub repeats: usize,
    pub discard: usize,
}

impl LatencyEstimate {
    /// Whether the value looks like a real loopback latency. Implausible
    /// estimates should be shown to the operator, not persisted.
    pub fn is_plausible(&self) -> bool {
        PLAUSIBLE_LATENCY_S.contains(&self.latency_s)
    }
}

/// Repeated-measurement latency calibration protocol.
#[derive(Debug, Clone)]
pub struct LatencyCalibrator {
    pub chirp: ChirpSpec,
    pub policy: CalibrationPolicy,
    /// Measurement cycles to run
    pub repeats: usize,
    /// Leading cycles discarded as warm-up
    pub discard: usize,
}

impl Default for LatencyCalibrator {
    fn default() -> Self {
        Self {
            chirp: ChirpSpec::default(),
            policy: CalibrationPolicy::default(),
            repeats: 7,
            discard: 2,
        }
    }
}

impl LatencyCalibrator {
    /// Run the full protocol on the engine's stream (opening it for
    /// `stream_config` if needed).
    pub fn measure(
        &self,
        engine: &mut RangingEngine,
        stream_config: &StreamConfig,
    ) -> Result<LatencyEstimate, RangingError> {
        self.chirp.validate()?;
        engine.ensure_stream(stream_config)?;

        let sample_rate = stream_config.sample_rate_hz;
        let transmit = generate_chirp(&self.chirp, sample_rate);
        if transmit.is_empty() {
            return Err(ValidationError::InvalidDuration(self.chirp.duration_s).into());
        }
        let ref_spec = self
            .chirp
            .with_fade(self.chirp.fade_fraction.max(MIN_REFERENCE_FADE));
        let reference = generate_chirp(&ref_spec, sample_rate);
        let extra_record_s = self.policy.window_s + 0.005;

        let stream = engine.stream_mut()?;

        // Silent warm-up job to flush stale driver buffers before any
        // timing-sensitive cycle.
        let silence = vec![0.0f32; transmit.len()];
        let _ = stream.play_and_record(&silence, extra_record_s)?;

        let cycle_period =
            Duration::from_secs_f64(self.chirp.duration_s + extra_record_s + CYCLE_GUARD_S);

        let mut all = Vec::with_capacity(self.repeats);
        for cycle in 0..self.repeats {
            let started = Instant::now();
            let recording = stream.play_and_record(&transmit, extra_record_s)?;
            let latency = self.cycle_latency(&reference, &recording, sample_rate);
            tracing::debug!(cycle, latency_ms = latency * 1e3, "calibration cycle");
            all.push(latency);

            let elapsed = started.elapsed();
            if elapsed < cycle_period {
                thread::sleep(cycle_period - elapsed);
            }
        }

        let kept: Vec<f64> = all
            .iter()
            .copied()
            .skip(self.discard.min(all.len()))
            .collect();
        let raw = if kept.is_empty() { all.clone() } else { kept };

        let used = filter_outliers(&raw, OUTLIER_K);
        let latency_s = median_f64(&used);
        let latency_std_s = std_dev(&used);

        let estimate = LatencyEstimate {
            latency_s,
            latency_std_s,
            lag_samples: latency_s * sample_rate as f64,
            raw_latencies_s: raw,
            used_latencies_s: used,
            repeats: self.repeats,
            discard: self.discard,
        };
        tracing::info!(
            latency_ms = estimate.latency_s * 1e3,
            std_ms = estimate.latency_std_s * 1e3,
            plausible = estimate.is_plausible(),
            "latency calibrated"
        );
        Ok(estimate)
    }

    /// Direct-path latency of one captured cycle, in seconds.
    ///
    /// The reference is correlated un-reversed, so the peak index *is*
    /// the lag of the embedded pulse.
    fn cycle_latency(&self, reference: &[f32], recording: &[f32], sample_rate: u32) -> f64 {
        let result = correlate(reference, recording);
        let window_hi = self.policy.window_samples(sample_rate);
        let index = self
            .policy
            .select(&result.correlation, window_hi)
            .map(|p| p.index)
            .unwrap_or(result.lag_index);
        let (refined_index, _) = parabolic_interpolate(&result.correlation, index);
        refined_index / sample_rate as f64
    }
}

/// Keep only samples within `k` MADs of the median. A zero MAD (all
/// samples identical up to noise) keeps everything.
pub fn filter_outliers(samples: &[f64], k: f64) -> Vec<f64> {
    if samples.is_empty() {
        return Vec::new();
    }
    let med = median_f64(samples);
    let spread = mad_f64(samples);
    if spread == 0.0 {
        return samples.to_vec();
    }
    samples
        .iter()
        .copied()
        .filter(|&v| (v - med).abs() <= k * spread)
        .collect()
}

fn median_f64(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

fn mad_f64(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let med = median_f64(values);
    let deviations: Vec<f64> = values.iter().map(|&v| (v - med).abs()).collect();
    median_f64(&deviations)
}

fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_outlier_filter_drops_ten_x_sample() {
        let samples = [0.0009, 0.0010, 0.00105, 0.0011, 0.010];
        let raw_median = median_f64(&samples);

        let used = filter_outliers(&samples, OUTLIER_K);
        assert_eq!(used.len(), 4);
        assert!(!used.contains(&0.010));

        let filtered_median = median_f64(&used);
        assert_ne!(filtered_median, raw_median);
        assert!(filtered_median < raw_median);
    }

    #[test]
    fn test_outlier_filter_keeps_identical_samples() {
        let samples = [0.0012; 5];
        assert_eq!(filter_outliers(&samples, OUTLIER_K).len(), 5);
    }

    #[test]
    fn test_median_and_std() {
        assert_relative_eq!(median_f64(&[1.0, 3.0, 2.0]), 2.0);
        assert_relative_eq!(median_f64(&[1.0, 2.0, 3.0, 4.0]), 2.5);
        assert_eq!(std_dev(&[5.0]), 0.0);
        assert_relative_eq!(std_dev(&[1.0, 3.0]), 1.0);
    }

    #[test]
    fn test_cycle_latency_recovers_known_shift() {
        let calibrator = LatencyCalibrator::default();
        let sr = 48_000;
        let transmit = generate_chirp(&calibrator.chirp, sr);
        let ref_spec = calibrator.chirp.with_fade(MIN_REFERENCE_FADE);
        let reference = generate_chirp(&ref_spec, sr);

        // Pulse arrives 58 samples after playback starts (~1.21 ms).
        let shift = 58;
        let mut recording = vec![0.0f32; transmit.len() + 960];
        for (i, &s) in transmit.iter().enumerate() {
            recording[i + shift] += 0.6 * s;
        }

        let latency = calibrator.cycle_latency(&reference, &recording, sr);
        assert_relative_eq!(latency, shift as f64 / sr as f64, epsilon = 2.0 / sr as f64);
    }

    #[test]
    fn test_plausibility_window() {
        let mut estimate = LatencyEstimate {
            latency_s: 0.00121,
            latency_std_s: 0.0,
            lag_samples: 58.0,
            raw_latencies_s: vec![],
            used_latencies_s: vec![],
            repeats: 7,
            discard: 2,
        };
        assert!(estimate.is_plausible());

        estimate.latency_s = 0.0001;
        assert!(!estimate.is_plausible());
        estimate.latency_s = 0.05;
        assert!(!estimate.is_plausible());
    }
}
