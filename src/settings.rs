//! Persistent ranging settings
//!
//! JSON file at `<config_dir>/echoranger/settings.json`. Every field has
//! a default, so a partial or missing file degrades gracefully instead of
//! failing the load.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{ChirpSpec, Medium, RangingRequest, StreamConfig};

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

fn default_system_latency_s() -> f64 {
    0.00121
}

fn default_min_distance_m() -> f64 {
    0.0
}

fn default_max_distance_m() -> f64 {
    17.0
}

fn default_start_freq_hz() -> f64 {
    1000.0
}

fn default_end_freq_hz() -> f64 {
    10000.0
}

fn default_chirp_duration_s() -> f64 {
    0.05
}

fn default_amplitude() -> f64 {
    0.8
}

fn default_filter_size() -> usize {
    3
}

fn default_sample_rate() -> u32 {
    crate::DEFAULT_SAMPLE_RATE
}

/// Persistent ranging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Calibrated fixed loopback latency in seconds
    #[serde(default = "default_system_latency_s")]
    pub system_latency_s: f64,
    #[serde(default = "default_min_distance_m")]
    pub min_distance_m: f64,
    #[serde(default = "default_max_distance_m")]
    pub max_distance_m: f64,
    #[serde(default = "default_start_freq_hz")]
    pub start_freq_hz: f64,
    #[serde(default = "default_end_freq_hz")]
    pub end_freq_hz: f64,
    #[serde(default = "default_chirp_duration_s")]
    pub chirp_duration_s: f64,
    #[serde(default = "default_amplitude")]
    pub amplitude: f64,
    /// Distance smoothing window; 0 or 1 disables smoothing
    #[serde(default = "default_filter_size")]
    pub filter_size: usize,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default)]
    pub medium: Medium,
    /// Capture device name (None = system default)
    #[serde(default)]
    pub rec_device: Option<String>,
    /// Playback device name (None = system default)
    #[serde(default)]
    pub play_device: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            system_latency_s: default_system_latency_s(),
            min_distance_m: default_min_distance_m(),
            max_distance_m: default_max_distance_m(),
            start_freq_hz: default_start_freq_hz(),
            end_freq_hz: default_end_freq_hz(),
            chirp_duration_s: default_chirp_duration_s(),
            amplitude: default_amplitude(),
            filter_size: default_filter_size(),
            sample_rate: default_sample_rate(),
            medium: Medium::Air,
            rec_device: None,
            play_device: None,
        }
    }
}

impl Settings {
    /// Settings file path: `<config_dir>/echoranger/settings.json`
    pub fn path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("echoranger")
            .join("settings.json")
    }

    /// Load settings from disk, falling back to defaults on any error
    pub fn load() -> Self {
        Self::load_from(&Self::path())
    }

    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(settings) => {
                    tracing::info!(path = %path.display(), "Loaded settings from disk");
                    settings
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to parse settings, using defaults");
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!(path = %path.display(), "No settings file found, using defaults");
                Self::default()
            }
        }
    }

    /// Save settings to disk, creating parent directories if needed
    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!(path = %path.display(), "Settings saved to disk");
        Ok(())
    }

    /// Chirp described by the persisted frequency/duration/amplitude.
    pub fn chirp_spec(&self) -> ChirpSpec {
        ChirpSpec::new(
            self.start_freq_hz,
            self.end_freq_hz,
            self.chirp_duration_s,
            self.amplitude,
        )
    }

    /// Full ranging request assembled from the persisted fields.
    pub fn ranging_request(&self) -> RangingRequest {
        RangingRequest {
            chirp: self.chirp_spec(),
            medium: self.medium,
            system_latency_s: self.system_latency_s,
            min_distance_m: self.min_distance_m,
            max_distance_m: self.max_distance_m,
            filter_size: self.filter_size,
        }
    }

    /// Hardware session config from the persisted fields.
    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            sample_rate_hz: self.sample_rate,
            rec_device: self.rec_device.clone(),
            play_device: self.play_device.clone(),
            ..StreamConfig::default()
        }
    }
}
