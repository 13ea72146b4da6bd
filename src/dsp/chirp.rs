//! Linear frequency-sweep (chirp) synthesis
//!
//! Chirps have near-ideal autocorrelation, which makes them good ranging
//! pulses: the matched filter compresses the whole sweep into one narrow
//! correlation peak. Transmit pulses are generated without a taper for
//! maximum energy; correlation references always get at least a minimal
//! edge taper to suppress sidelobes.

use crate::config::ChirpSpec;

/// Minimum edge taper forced onto correlation references.
pub const MIN_REFERENCE_FADE: f64 = 0.05;

/// Generate a linear sweep from `start_freq_hz` to `end_freq_hz` over
/// `duration_s`, sampled at `sample_rate` Hz.
///
/// The instantaneous phase is `2π(f0·t + (f1−f0)/(2T)·t²)`, so the sweep
/// is exactly linear in frequency. When `fade_fraction > 0`, a symmetric
/// linear ramp tapers the first and last `fade_fraction` of the samples.
pub fn generate_chirp(spec: &ChirpSpec, sample_rate: u32) -> Vec<f32> {
    let sr = sample_rate as f64;
    let n = (sr * spec.duration_s) as usize;
    let rate = (spec.end_freq_hz - spec.start_freq_hz) / (2.0 * spec.duration_s);

    let mut sweep: Vec<f32> = (0..n)
        .map(|i| {
            let t = i as f64 / sr;
            let phase = 2.0 * std::f64::consts::PI * (spec.start_freq_hz * t + rate * t * t);
            (spec.amplitude * phase.cos()) as f32
        })
        .collect();

    if spec.fade_fraction > 0.0 && n > 0 {
        apply_fade(&mut sweep, spec.fade_fraction);
    }

    sweep
}

/// Symmetric linear edge taper over `fade_fraction` of the samples.
fn apply_fade(samples: &mut [f32], fade_fraction: f64) {
    let n = samples.len();
    let fade_len = ((n as f64 * fade_fraction) as usize).max(1).min(n);

    for i in 0..fade_len {
        let ramp = i as f32 / fade_len as f32;
        samples[i] *= ramp;
        samples[n - 1 - i] *= ramp;
    }
}

/// Rescale so the maximum absolute sample equals `peak`.
///
/// A numerically silent input (max < 1e-10) yields an all-zero waveform
/// instead of dividing by near-zero and propagating NaN/Inf.
pub fn normalize(samples: &[f32], peak: f32) -> Vec<f32> {
    let max_val = samples.iter().fold(0.0f32, |m, &x| m.max(x.abs()));

    if max_val < 1e-10 {
        return vec![0.0; samples.len()];
    }

    let scale = peak / max_val;
    samples.iter().map(|&x| x * scale).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_chirp_length_and_amplitude() {
        let spec = ChirpSpec::new(1000.0, 2000.0, 0.1, 0.5);
        let chirp = generate_chirp(&spec, 10000);

        assert_eq!(chirp.len(), 1000);
        let max = chirp.iter().fold(0.0f32, |m, &x| m.max(x.abs()));
        assert!(max <= 0.51, "max |x| should be bounded by amplitude, got {max}");
    }

    #[test]
    fn test_chirp_starts_at_peak() {
        // Phase 0 at t=0: cos(0) = 1 scaled by amplitude.
        let spec = ChirpSpec::new(1000.0, 2000.0, 0.1, 0.5);
        let chirp = generate_chirp(&spec, 10000);
        assert_relative_eq!(chirp[0], 0.5, max_relative = 1e-6);
    }

    #[test]
    fn test_fade_tapers_edges() {
        let spec = ChirpSpec::new(2000.0, 20000.0, 0.05, 0.8);
        let plain = generate_chirp(&spec, 48000);
        let faded = generate_chirp(&spec.with_fade(0.05), 48000);

        assert_eq!(plain.len(), faded.len());
        assert_eq!(faded[0], 0.0);
        assert_eq!(faded[faded.len() - 1], 0.0);
        // Middle is untouched.
        let mid = plain.len() / 2;
        assert_eq!(plain[mid], faded[mid]);
    }

    #[test]
    fn test_normalize_exact() {
        let sig = [1.0f32, 2.0, 3.0, 4.0, 5.0];
        let norm = normalize(&sig, 1.0);

        let max = norm.iter().fold(0.0f32, |m, &x| m.max(x.abs()));
        assert_relative_eq!(max, 1.0);
        assert_relative_eq!(norm[0], 0.2);
        assert_relative_eq!(norm[4], 1.0);
    }

    #[test]
    fn test_normalize_silent_input_is_zeroed() {
        let sig = [1e-12f32, -1e-12, 0.0];
        let norm = normalize(&sig, 1.0);
        assert!(norm.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_normalize_negative_peak_sample() {
        let sig = [0.1f32, -0.5, 0.2];
        let norm = normalize(&sig, 0.9);
        assert_relative_eq!(norm[1], -0.9);
    }
}
