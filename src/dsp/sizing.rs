//! Chirp parameter sizing from matched-filter theory
//!
//! Helpers for choosing pulse duration and bandwidth before a measurement
//! session. All formulas come from standard matched-filter relations: the
//! time-bandwidth product sets the processing gain, and the Rayleigh
//! criterion ties bandwidth to distance resolution (the factor of two
//! accounts for the round trip).

/// Time-bandwidth product and the resulting processing gain in dB.
pub fn processing_gain(duration_s: f64, bandwidth_hz: f64) -> (f64, f64) {
    let tbp = duration_s * bandwidth_hz;
    (tbp, 10.0 * tbp.log10())
}

/// Bandwidth required for a target distance resolution: `BW = c / (2·Δr)`.
pub fn optimal_bandwidth(target_resolution_m: f64, sound_speed_mps: f64) -> f64 {
    sound_speed_mps / (2.0 * target_resolution_m)
}

/// Maximum unambiguous distance for a pulse repetition period equal to the
/// chirp duration: `d_max = c·T / 2`.
pub fn max_unambiguous_distance(duration_s: f64, sound_speed_mps: f64) -> f64 {
    sound_speed_mps * duration_s / 2.0
}

/// Adaptive detection threshold for matched-filter output.
///
/// Returns `(threshold, mainlobe_width_samples, processing_gain_db)`.
/// The threshold sits 6 dB above the matched-filter noise floor
/// `1/√TBP`, which puts detection probability near 3-σ; the mainlobe
/// width accounts for the broadening introduced by the edge taper.
pub fn correlation_threshold(
    duration_s: f64,
    bandwidth_hz: f64,
    sample_rate: f64,
    window_alpha: f64,
) -> (f64, f64, f64) {
    let time_resolution_s = 1.0 / bandwidth_hz;
    let mainlobe_width_samples = time_resolution_s * (1.0 + window_alpha * 0.5) * sample_rate;

    let tbp = duration_s * bandwidth_hz;
    let processing_gain_db = 10.0 * tbp.log10();

    let noise_floor = 1.0 / tbp.sqrt();
    let detection_margin = 10f64.powf(6.0 / 20.0);

    (noise_floor * detection_margin, mainlobe_width_samples, processing_gain_db)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_processing_gain() {
        let (tbp, gain_db) = processing_gain(0.05, 10000.0);
        assert_relative_eq!(tbp, 500.0);
        assert_relative_eq!(gain_db, 10.0 * 500.0f64.log10());
    }

    #[test]
    fn test_optimal_bandwidth() {
        assert_relative_eq!(optimal_bandwidth(0.01, 340.0), 17000.0);
    }

    #[test]
    fn test_max_unambiguous_distance() {
        assert_relative_eq!(max_unambiguous_distance(0.05, 343.0), 8.575);
    }

    #[test]
    fn test_correlation_threshold_positive() {
        let (threshold, width, gain) = correlation_threshold(0.05, 10000.0, 48000.0, 0.25);
        assert!(threshold > 0.0);
        assert!(width > 0.0);
        assert!(gain > 0.0);
    }
}
