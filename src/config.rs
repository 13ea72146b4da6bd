//! Value types shared across the ranging engine
//!
//! [`ChirpSpec`] and [`StreamConfig`] are plain immutable values; a
//! [`StreamConfig`] additionally acts as the identity of a hardware
//! session — changing any field forces the engine to close and reopen its
//! duplex stream.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Propagation medium for the acoustic path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Medium {
    Air,
    Water,
}

impl Medium {
    /// Speed of sound in m/s (air at 20 °C, fresh water at 20 °C).
    pub fn sound_speed_mps(&self) -> f64 {
        match self {
            Medium::Air => 343.0,
            Medium::Water => 1480.0,
        }
    }
}

impl Default for Medium {
    fn default() -> Self {
        Medium::Air
    }
}

/// Parameters of a linear frequency-sweep pulse.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChirpSpec {
    /// Sweep start frequency in Hz
    pub start_freq_hz: f64,
    /// Sweep end frequency in Hz (must exceed the start)
    pub end_freq_hz: f64,
    /// Pulse duration in seconds, (0, 1.0]
    pub duration_s: f64,
    /// Peak amplitude in [0, 1]
    pub amplitude: f64,
    /// Fraction of the pulse tapered at each edge, [0, 1].
    /// 0 = no taper (maximum transmitted energy).
    pub fade_fraction: f64,
}

impl ChirpSpec {
    pub fn new(start_freq_hz: f64, end_freq_hz: f64, duration_s: f64, amplitude: f64) -> Self {
        Self {
            start_freq_hz,
            end_freq_hz,
            duration_s,
            amplitude,
            fade_fraction: 0.0,
        }
    }

    /// Copy of this spec with a different fade fraction.
    pub fn with_fade(&self, fade_fraction: f64) -> Self {
        Self {
            fade_fraction,
            ..*self
        }
    }

    pub fn bandwidth_hz(&self) -> f64 {
        self.end_freq_hz - self.start_freq_hz
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(self.duration_s > 0.0 && self.duration_s <= 1.0) {
            return Err(ValidationError::InvalidDuration(self.duration_s));
        }
        if !(self.start_freq_hz > 0.0 && self.start_freq_hz < self.end_freq_hz) {
            return Err(ValidationError::InvalidFrequencies {
                start: self.start_freq_hz,
                end: self.end_freq_hz,
            });
        }
        if !(0.0..=1.0).contains(&self.amplitude) {
            return Err(ValidationError::InvalidAmplitude(self.amplitude));
        }
        if !(0.0..=1.0).contains(&self.fade_fraction) {
            return Err(ValidationError::InvalidFadeFraction(self.fade_fraction));
        }
        Ok(())
    }
}

impl Default for ChirpSpec {
    fn default() -> Self {
        Self {
            start_freq_hz: 1000.0,
            end_freq_hz: 10000.0,
            duration_s: 0.05,
            amplitude: 0.8,
            fade_fraction: 0.0,
        }
    }
}

/// Identity and parameters of a duplex hardware session.
///
/// Equality of two configs means the same session may be reused; any
/// difference invalidates an open stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    /// Sample rate in Hz
    pub sample_rate_hz: u32,
    /// Frames per driver block
    pub frames_per_block: usize,
    /// Capture channel count
    pub rec_channels: u16,
    /// Playback channel count
    pub play_channels: u16,
    /// Capture device name, `None` = system default
    pub rec_device: Option<String>,
    /// Playback device name, `None` = system default
    pub play_device: Option<String>,
    /// Requested driver latency. cpal only exposes latency through the
    /// block size, so this is advisory and only participates in session
    /// identity.
    pub requested_latency: Option<Duration>,
}

impl StreamConfig {
    /// Duration of one driver block in seconds.
    pub fn block_duration_s(&self) -> f64 {
        self.frames_per_block as f64 / self.sample_rate_hz as f64
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: crate::DEFAULT_SAMPLE_RATE,
            frames_per_block: 2048,
            rec_channels: 1,
            play_channels: 1,
            rec_device: None,
            play_device: None,
            requested_latency: None,
        }
    }
}

/// One distance-measurement request.
#[derive(Debug, Clone)]
pub struct RangingRequest {
    pub chirp: ChirpSpec,
    pub medium: Medium,
    /// Calibrated fixed system latency in seconds (subtracted from the lag)
    pub system_latency_s: f64,
    /// Echoes closer than this are rejected as direct-path leakage
    pub min_distance_m: f64,
    /// Bounds the echo search window and sizes the record window
    pub max_distance_m: f64,
    /// Smoothing buffer size; 0 or 1 disables smoothing
    pub filter_size: usize,
}

impl RangingRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.chirp.validate()?;
        if self.min_distance_m < 0.0 || self.min_distance_m >= self.max_distance_m {
            return Err(ValidationError::InvalidDistanceBounds {
                min: self.min_distance_m,
                max: self.max_distance_m,
            });
        }
        Ok(())
    }
}

impl Default for RangingRequest {
    fn default() -> Self {
        Self {
            chirp: ChirpSpec::default(),
            medium: Medium::Air,
            system_latency_s: 0.0,
            min_distance_m: 0.0,
            max_distance_m: 17.0,
            filter_size: 3,
        }
    }
}
