//! Echoranger - acoustic chirp rangefinder
//!
//! Measures distance to a reflecting surface with an audible linear chirp:
//! a pulse is played through a speaker, the echo is captured on a
//! microphone, and a matched-filter cross-correlation locates the echo lag
//! with sub-sample precision. A repeated-measurement calibration protocol
//! estimates the fixed loopback latency of the audio hardware so it can be
//! subtracted from the round trip.

pub mod audio;
pub mod config;
pub mod dsp;
pub mod error;
pub mod latency;
pub mod ranging;
pub mod settings;

pub use audio::{DuplexAudioStream, StreamState};
pub use config::{ChirpSpec, Medium, RangingRequest, StreamConfig};
pub use dsp::chirp::{generate_chirp, normalize};
pub use dsp::correlation::{correlate, find_peaks, parabolic_interpolate, CorrelationResult};
pub use error::{RangingError, StreamError, ValidationError};
pub use latency::{LatencyCalibrator, LatencyEstimate};
pub use ranging::{MeasurementResult, RangingEngine, SmoothingBuffer};
pub use settings::Settings;

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default sample rate for ranging (48kHz, the common full-duplex rate
/// on consumer hardware)
pub const DEFAULT_SAMPLE_RATE: u32 = 48000;
