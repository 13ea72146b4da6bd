//! Distance estimation engine
//!
//! [`RangingEngine`] owns everything one ranging session needs: the
//! duplex audio stream, the cached transmit/reference waveform pair, and
//! the distance smoothing buffer. Callers hold the engine and drive it
//! synchronously; nothing here is process-global.

use std::collections::VecDeque;
use std::time::Instant;

use serde::Serialize;

use crate::audio::DuplexAudioStream;
use crate::config::{ChirpSpec, Medium, RangingRequest, StreamConfig};
use crate::dsp::chirp::{generate_chirp, normalize, MIN_REFERENCE_FADE};
use crate::dsp::correlation::{correlate, parabolic_interpolate, PeakCandidate};
use crate::dsp::peaks::RangingPolicy;
use crate::error::{RangingError, StreamError, ValidationError};

/// Tail guard added to the record window beyond the farthest round trip.
const RECORD_GUARD_S: f64 = 0.01;

/// One completed distance measurement.
#[derive(Debug, Clone, Serialize)]
pub struct MeasurementResult {
    /// Round-trip propagation time minus system latency, seconds
    pub time_of_flight_s: f64,
    /// One-way distance in meters
    pub distance_m: f64,
    /// Mean over the smoothing buffer (equals `distance_m` when
    /// smoothing is disabled)
    pub smoothed_distance_m: f64,
    /// Integer lag of the selected peak, samples
    pub lag_samples: usize,
    /// Sub-sample lag after parabolic refinement
    pub refined_lag: f64,
    /// Correlation amplitude at the integer peak
    pub peak: f32,
    /// Correlation amplitude after refinement
    pub refined_peak: f64,
    pub sound_speed_mps: f64,
    pub medium: Medium,
    /// Wall-clock duration of the whole measurement, seconds
    pub total_time_s: f64,
    /// System latency that was subtracted, seconds
    pub system_latency_s: f64,
    /// Recording tail beyond the pulse, seconds
    pub extra_record_s: f64,
}

/// Bounded FIFO of recent distance estimates.
///
/// Owned exclusively by the engine; cleared only on explicit request so
/// a read never perturbs the history.
#[derive(Debug, Default)]
pub struct SmoothingBuffer {
    values: VecDeque<f64>,
    capacity: usize,
}

impl SmoothingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Change the capacity, dropping the oldest entries if shrinking.
    pub fn resize(&mut self, capacity: usize) {
        self.capacity = capacity;
        while self.values.len() > capacity {
            self.values.pop_front();
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.capacity == 0 {
            return;
        }
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

/// Cached waveforms for one (chirp, sample rate) pair.
///
/// The transmit pulse keeps the caller's fade (default none, for maximum
/// energy) and is normalized back to the requested amplitude; the
/// correlation reference always carries at least [`MIN_REFERENCE_FADE`]
/// of taper to suppress spectral leakage. [`correlate`] conjugates the
/// reference spectrum, so it already acts as a matched filter and the
/// correlation peak index is the echo lag directly.
struct ChirpCache {
    spec: ChirpSpec,
    sample_rate: u32,
    transmit: Vec<f32>,
    reference: Vec<f32>,
}

fn build_cache(spec: &ChirpSpec, sample_rate: u32) -> ChirpCache {
    let transmit = normalize(&generate_chirp(spec, sample_rate), spec.amplitude as f32);
    let ref_spec = spec.with_fade(spec.fade_fraction.max(MIN_REFERENCE_FADE));
    let reference = generate_chirp(&ref_spec, sample_rate);
    ChirpCache {
        spec: *spec,
        sample_rate,
        transmit,
        reference,
    }
}

/// Recording tail needed to capture the farthest echo plus latency.
fn extra_record_seconds(request: &RangingRequest) -> f64 {
    let round_trip = 2.0 * request.max_distance_m / request.medium.sound_speed_mps();
    round_trip + request.system_latency_s + RECORD_GUARD_S
}

/// Owns one ranging session: stream, waveform cache, smoothing history.
pub struct RangingEngine {
    stream: Option<DuplexAudioStream>,
    chirp_cache: Option<ChirpCache>,
    smoothing: SmoothingBuffer,
    policy: RangingPolicy,
}

impl Default for RangingEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RangingEngine {
    pub fn new() -> Self {
        Self {
            stream: None,
            chirp_cache: None,
            smoothing: SmoothingBuffer::default(),
            policy: RangingPolicy::default(),
        }
    }

    pub fn with_policy(policy: RangingPolicy) -> Self {
        let mut engine = Self::new();
        engine.policy = policy;
        engine
    }

    /// Open (or reuse) the duplex stream for `config`.
    ///
    /// An open stream with a different config is closed first; settle
    /// delays inside open/close give the driver room to recover.
    pub fn ensure_stream(&mut self, config: &StreamConfig) -> Result<(), StreamError> {
        if let Some(stream) = &self.stream {
            if stream.config() == config {
                return Ok(());
            }
            tracing::info!("stream config changed, reopening");
            self.close();
        }
        self.stream = Some(DuplexAudioStream::open(config)?);
        Ok(())
    }

    /// Close the stream if open. Smoothing history survives a reopen.
    pub fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.close();
        }
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Drop accumulated distance history, e.g. when ranging restarts or
    /// the target is known to have moved.
    pub fn clear_smoothing(&mut self) {
        self.smoothing.clear();
    }

    /// Run one full measurement: synthesize, play+record, estimate,
    /// smooth.
    pub fn measure_distance(
        &mut self,
        stream_config: &StreamConfig,
        request: &RangingRequest,
    ) -> Result<MeasurementResult, RangingError> {
        request.validate()?;
        let started = Instant::now();

        self.ensure_stream(stream_config)?;
        let sample_rate = stream_config.sample_rate_hz;
        let transmit = self.waveforms(&request.chirp, sample_rate).transmit.clone();
        let extra_record_s = extra_record_seconds(request);

        let stream = self.stream.as_mut().ok_or(StreamError::Closed)?;
        let recording = stream.play_and_record(&transmit, extra_record_s)?;

        let mut result = self.estimate_from_recording(request, &recording, sample_rate)?;

        if request.filter_size > 1 {
            self.smoothing.resize(request.filter_size);
            self.smoothing.push(result.distance_m);
            result.smoothed_distance_m = self.smoothing.mean();
        }
        result.total_time_s = started.elapsed().as_secs_f64();

        tracing::info!(
            distance_m = result.distance_m,
            smoothed_m = result.smoothed_distance_m,
            lag = result.lag_samples,
            peak = result.peak,
            "distance measured"
        );
        Ok(result)
    }

    /// Estimate a distance from an already captured recording.
    ///
    /// Pure with respect to hardware: used by `measure_distance` and
    /// directly by tests and offline analysis. Does not touch the
    /// smoothing buffer, so `smoothed_distance_m` equals `distance_m`.
    pub fn estimate_from_recording(
        &mut self,
        request: &RangingRequest,
        recording: &[f32],
        sample_rate: u32,
    ) -> Result<MeasurementResult, RangingError> {
        request.validate()?;

        let cache = self.waveforms(&request.chirp, sample_rate);
        if cache.reference.is_empty() {
            // duration_s can pass its range check yet round down to zero
            // samples at the session rate.
            return Err(ValidationError::InvalidDuration(request.chirp.duration_s).into());
        }
        let correlation = correlate(&cache.reference, recording);

        // correlate() conjugates the reference spectrum, so the peak
        // index is the echo lag directly (same convention as the
        // calibrator).
        let sr = sample_rate as f64;
        let speed = request.medium.sound_speed_mps();
        let latency_samples = (request.system_latency_s * sr) as usize;

        let min_lag_from_distance =
            ((2.0 * request.min_distance_m / speed + request.system_latency_s) * sr) as usize;
        let lag_lo = (latency_samples + self.policy.guard_samples).max(min_lag_from_distance);
        let lag_hi =
            ((2.0 * request.max_distance_m / speed + request.system_latency_s) * sr) as usize;

        let selected = self
            .policy
            .select(&correlation.correlation, lag_lo, lag_hi)
            .unwrap_or(PeakCandidate {
                index: correlation.lag_index,
                amplitude: correlation.peak_value,
            });

        let (refined_lag, refined_peak) =
            parabolic_interpolate(&correlation.correlation, selected.index);

        let time_of_flight_s = (refined_lag / sr - request.system_latency_s).max(0.0);
        let distance_m = speed * time_of_flight_s / 2.0;

        tracing::debug!(
            lag = selected.index,
            refined_lag,
            peak = selected.amplitude,
            "echo selected"
        );

        Ok(MeasurementResult {
            time_of_flight_s,
            distance_m,
            smoothed_distance_m: distance_m,
            lag_samples: selected.index,
            refined_lag,
            peak: selected.amplitude,
            refined_peak,
            sound_speed_mps: speed,
            medium: request.medium,
            total_time_s: 0.0,
            system_latency_s: request.system_latency_s,
            extra_record_s: extra_record_seconds(request),
        })
    }

    /// Borrow the open stream, e.g. for latency calibration sharing the
    /// same session.
    pub(crate) fn stream_mut(&mut self) -> Result<&mut DuplexAudioStream, StreamError> {
        self.stream.as_mut().ok_or(StreamError::Closed)
    }

    fn waveforms(&mut self, spec: &ChirpSpec, sample_rate: u32) -> &ChirpCache {
        let stale = match &self.chirp_cache {
            Some(cache) => cache.spec != *spec || cache.sample_rate != sample_rate,
            None => true,
        };
        if stale {
            self.chirp_cache = None;
        }
        self.chirp_cache
            .get_or_insert_with(|| build_cache(spec, sample_rate))
    }
}

impl Drop for RangingEngine {
    fn drop(&mut self) {
        self.close();
    }
}
