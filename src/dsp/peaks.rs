//! Echo-peak selection policies
//!
//! Two policies share the greedy peak extraction in
//! [`crate::dsp::correlation::find_peaks`] but differ in objective:
//!
//! - **Ranging**: the strongest physically plausible echo inside a
//!   distance-derived lag window, with a tie-break that prefers the
//!   earlier of two near-equal peaks for temporal stability.
//! - **Calibration**: the *earliest* strong peak in a narrow window just
//!   after transmission, favoring the direct electro-acoustic path over
//!   early reflections.
//!
//! The tie-break and threshold values were tuned empirically on real
//! hardware; they are policy fields rather than constants.

use crate::dsp::correlation::{find_peaks, PeakCandidate};

/// Peak selection policy for distance ranging.
#[derive(Debug, Clone)]
pub struct RangingPolicy {
    /// Guard in samples added after the system latency before the window
    /// opens (rejects direct-path leakage)
    pub guard_samples: usize,
    /// When the two strongest in-window peaks are within this relative
    /// amplitude of each other, the earlier one wins
    pub tie_break_ratio: f32,
    /// How many candidate peaks to extract
    pub num_peaks: usize,
    /// Minimum peak separation in samples
    pub min_separation: usize,
}

impl Default for RangingPolicy {
    fn default() -> Self {
        Self {
            guard_samples: 50,
            tie_break_ratio: 0.2,
            num_peaks: 15,
            min_separation: 50,
        }
    }
}

impl RangingPolicy {
    /// Choose the target-echo peak inside `[window_lo, window_hi]`
    /// (inclusive, in correlation-array indices).
    ///
    /// Candidates are extracted from the whole array, filtered by the
    /// window, and the strongest survivor is taken — unless the runner-up
    /// is both earlier and within `tie_break_ratio` of its amplitude, in
    /// which case the earlier peak wins. An empty candidate set falls
    /// back to the raw maximum of the window.
    pub fn select(
        &self,
        correlation: &[f32],
        window_lo: usize,
        window_hi: usize,
    ) -> Option<PeakCandidate> {
        if correlation.is_empty() {
            return None;
        }
        let window_hi = window_hi.min(correlation.len() - 1);
        if window_lo > window_hi {
            return window_max(correlation, 0, correlation.len() - 1);
        }

        let in_window: Vec<PeakCandidate> =
            find_peaks(correlation, self.num_peaks, self.min_separation)
                .into_iter()
                .filter(|p| p.index >= window_lo && p.index <= window_hi)
                .collect();

        match in_window.as_slice() {
            [] => window_max(correlation, window_lo, window_hi),
            [only] => Some(*only),
            [best, runner_up, ..] => {
                let close = runner_up.amplitude >= best.amplitude * (1.0 - self.tie_break_ratio);
                if close && runner_up.index < best.index {
                    Some(*runner_up)
                } else {
                    Some(*best)
                }
            }
        }
    }
}

/// Peak selection policy for system-latency calibration.
#[derive(Debug, Clone)]
pub struct CalibrationPolicy {
    /// Width of the post-transmit search window in seconds
    pub window_s: f64,
    /// Noise-floor threshold multiplier: a peak must exceed
    /// `median + noise_k · MAD` of the window
    pub noise_k: f32,
    /// A peak must also exceed this fraction of the window maximum
    pub strong_fraction: f32,
    /// How many candidate peaks to extract
    pub num_peaks: usize,
    /// Minimum peak separation in samples
    pub min_separation: usize,
}

impl Default for CalibrationPolicy {
    fn default() -> Self {
        Self {
            window_s: 0.02,
            noise_k: 3.0,
            strong_fraction: 0.3,
            num_peaks: 10,
            min_separation: 20,
        }
    }
}

impl CalibrationPolicy {
    /// Window width in samples at the given rate.
    pub fn window_samples(&self, sample_rate: u32) -> usize {
        (self.window_s * sample_rate as f64) as usize
    }

    /// Choose the direct-path peak inside `[0, window_hi]`.
    ///
    /// Takes the *earliest* candidate whose amplitude clears both the
    /// MAD-based noise floor of the window and `strong_fraction` of the
    /// window's strongest peak. A degenerate window falls back to its raw
    /// maximum.
    pub fn select(&self, correlation: &[f32], window_hi: usize) -> Option<PeakCandidate> {
        if correlation.is_empty() {
            return None;
        }
        let window_hi = window_hi.min(correlation.len() - 1);
        let window = &correlation[..=window_hi];

        let candidates = find_peaks(window, self.num_peaks, self.min_separation);
        let Some(strongest) = candidates.first() else {
            return window_max(correlation, 0, window_hi);
        };

        let med = median(window);
        let spread = mad(window);
        let noise_floor = med + self.noise_k * spread;
        let strong = strongest.amplitude * self.strong_fraction;

        candidates
            .iter()
            .filter(|p| p.amplitude > noise_floor && p.amplitude >= strong)
            .min_by_key(|p| p.index)
            .copied()
            .or(Some(*strongest))
    }
}

/// Raw maximum of `correlation[lo..=hi]` as a [`PeakCandidate`].
fn window_max(correlation: &[f32], lo: usize, hi: usize) -> Option<PeakCandidate> {
    correlation
        .get(lo..=hi)?
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, &amplitude)| PeakCandidate {
            index: lo + i,
            amplitude,
        })
}

/// Median of a slice. Empty input yields 0.
pub fn median(values: &[f32]) -> f32 {
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

/// Median absolute deviation, a robust spread statistic.
pub fn mad(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let med = median(values);
    let deviations: Vec<f32> = values.iter().map(|&v| (v - med).abs()).collect();
    median(&deviations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_median_odd_even() {
        assert_relative_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
        assert_relative_eq!(median(&[4.0, 1.0, 2.0, 3.0]), 2.5);
        assert_eq!(median(&[]), 0.0);
    }

    #[test]
    fn test_mad_robust_to_outlier() {
        let values = [1.0, 1.1, 0.9, 1.0, 10.0];
        assert!(mad(&values) < 0.2, "MAD should ignore the outlier");
    }

    #[test]
    fn test_ranging_selects_strongest_in_window() {
        // Strong direct-path peak at 5, echo at 40, noise at 70.
        let mut corr = vec![0.0f32; 100];
        corr[5] = 10.0;
        corr[40] = 4.0;
        corr[70] = 0.5;

        let policy = RangingPolicy {
            min_separation: 2,
            ..Default::default()
        };
        let peak = policy.select(&corr, 20, 60).unwrap();
        assert_eq!(peak.index, 40);
    }

    #[test]
    fn test_ranging_tie_break_prefers_earlier() {
        let mut corr = vec![0.0f32; 100];
        corr[30] = 3.8; // earlier, within 20% of the strongest
        corr[60] = 4.0;

        let policy = RangingPolicy {
            min_separation: 2,
            ..Default::default()
        };
        let peak = policy.select(&corr, 10, 90).unwrap();
        assert_eq!(peak.index, 30);
    }

    #[test]
    fn test_ranging_no_tie_break_when_clearly_weaker() {
        let mut corr = vec![0.0f32; 100];
        corr[30] = 2.0;
        corr[60] = 4.0;

        let policy = RangingPolicy {
            min_separation: 2,
            ..Default::default()
        };
        let peak = policy.select(&corr, 10, 90).unwrap();
        assert_eq!(peak.index, 60);
    }

    #[test]
    fn test_ranging_empty_window_falls_back_to_maximum() {
        let mut corr = vec![0.0f32; 50];
        corr[10] = 5.0;

        let policy = RangingPolicy::default();
        // Degenerate window (lo > hi) falls back to the global maximum.
        let peak = policy.select(&corr, 40, 20).unwrap();
        assert_eq!(peak.index, 10);
    }

    #[test]
    fn test_ranging_all_negative_window_falls_back_to_raw_max() {
        let corr = vec![-1.0f32; 50];
        let policy = RangingPolicy::default();
        let peak = policy.select(&corr, 10, 30).unwrap();
        assert!(peak.index >= 10 && peak.index <= 30);
    }

    #[test]
    fn test_calibration_prefers_earliest_strong_peak() {
        // Direct path at 48, slightly stronger early reflection at 120.
        let mut corr = vec![0.01f32; 960];
        corr[48] = 5.0;
        corr[120] = 6.0;

        let policy = CalibrationPolicy::default();
        let peak = policy.select(&corr, 959).unwrap();
        assert_eq!(peak.index, 48);
    }

    #[test]
    fn test_calibration_skips_sub_threshold_early_bump() {
        // Tiny early bump below the strong fraction; real path at 100.
        let mut corr = vec![0.0f32; 960];
        corr[10] = 0.2;
        corr[100] = 5.0;

        let policy = CalibrationPolicy::default();
        let peak = policy.select(&corr, 959).unwrap();
        assert_eq!(peak.index, 100);
    }

    #[test]
    fn test_calibration_degenerate_window_uses_raw_max() {
        let corr = vec![-0.5f32; 100];
        let policy = CalibrationPolicy::default();
        let peak = policy.select(&corr, 99).unwrap();
        assert_eq!(peak.amplitude, -0.5);
    }
}
