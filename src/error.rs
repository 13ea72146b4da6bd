//! Error taxonomy for the ranging engine
//!
//! Errors are split into two explicit categories so callers (and the
//! engine's own retry logic) can key on kind rather than message text:
//!
//! - [`ValidationError`]: bad parameters. Fatal to the call, never retried.
//! - [`StreamError`]: the hardware layer misbehaved. Some of these are
//!   transient (a single xrun is retried once inside the stream), the rest
//!   are surfaced immediately.

use thiserror::Error;

/// Parameter validation errors. Fatal to the call, never retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("chirp duration must be in (0, 1.0] s, got {0}")]
    InvalidDuration(f64),

    #[error("chirp frequencies must satisfy 0 < start < end, got start={start} Hz, end={end} Hz")]
    InvalidFrequencies { start: f64, end: f64 },

    #[error("amplitude must be in [0, 1], got {0}")]
    InvalidAmplitude(f64),

    #[error("fade fraction must be in [0, 1], got {0}")]
    InvalidFadeFraction(f64),

    #[error("distance bounds must satisfy 0 <= min < max, got min={min} m, max={max} m")]
    InvalidDistanceBounds { min: f64, max: f64 },

    #[error("extra_record_seconds must be >= 0, got {0}")]
    NegativeExtraRecord(f64),
}

/// Errors from the duplex audio stream layer.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("audio stream is busy: a job is already in flight")]
    Busy,

    #[error("timed out waiting for the audio stream to complete a job")]
    Timeout,

    #[error("buffer under/overrun persisted after retry")]
    Xrun,

    #[error("audio device not found: {0}")]
    DeviceNotFound(String),

    #[error("device {device} does not support {rate} Hz")]
    UnsupportedSampleRate { device: String, rate: u32 },

    #[error("audio stream is closed")]
    Closed,

    #[error("failed to enumerate audio devices: {0}")]
    Devices(#[from] cpal::DevicesError),

    #[error("failed to build audio stream: {0}")]
    Build(#[from] cpal::BuildStreamError),

    #[error("failed to start audio stream: {0}")]
    Play(#[from] cpal::PlayStreamError),
}

impl StreamError {
    /// Whether a retry of the same job could plausibly succeed.
    ///
    /// Only xruns are treated as transient; the stream already retries
    /// them once internally, so a surfaced [`StreamError::Xrun`] means the
    /// retry was also hit.
    pub fn is_transient(&self) -> bool {
        matches!(self, StreamError::Xrun)
    }
}

/// Umbrella error for all ranging operations.
#[derive(Error, Debug)]
pub enum RangingError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error(transparent)]
    Stream(#[from] StreamError),
}
