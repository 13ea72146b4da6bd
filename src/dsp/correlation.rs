//! FFT-based matched-filter cross-correlation
//!
//! Correlation is computed via the convolution theorem:
//! `corr = IFFT(FFT(recording) · conj(FFT(reference)))`, with both signals
//! zero-padded to the next power of two. For typical pulse lengths this is
//! orders of magnitude faster than direct correlation.

use rustfft::{num_complex::Complex, FftPlanner};

/// Result of one cross-correlation.
#[derive(Debug, Clone)]
pub struct CorrelationResult {
    /// Index of the global maximum in `correlation`
    pub lag_index: usize,
    /// Value at the global maximum
    pub peak_value: f32,
    /// Full correlation array, length = len(recording) + len(reference) − 1
    pub correlation: Vec<f32>,
}

/// A correlation peak found by [`find_peaks`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakCandidate {
    /// Sample index in the correlation array
    pub index: usize,
    /// Correlation amplitude at the peak
    pub amplitude: f32,
}

/// Cross-correlate `recording` against `reference`.
///
/// For a reference embedded in the recording at offset `s`, the peak
/// lands at index `s`: the conjugate multiply already time-reverses the
/// reference, so this *is* the matched filter and the peak index is the
/// lag directly.
pub fn correlate(reference: &[f32], recording: &[f32]) -> CorrelationResult {
    let n = recording.len() + reference.len() - 1;
    let n_fft = n.next_power_of_two();

    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(n_fft);
    let ifft = planner.plan_fft_inverse(n_fft);

    let mut ref_c: Vec<Complex<f32>> = reference
        .iter()
        .map(|&x| Complex::new(x, 0.0))
        .chain(std::iter::repeat(Complex::new(0.0, 0.0)))
        .take(n_fft)
        .collect();
    let mut rec_c: Vec<Complex<f32>> = recording
        .iter()
        .map(|&x| Complex::new(x, 0.0))
        .chain(std::iter::repeat(Complex::new(0.0, 0.0)))
        .take(n_fft)
        .collect();

    fft.process(&mut ref_c);
    fft.process(&mut rec_c);

    // Cross-correlation in the frequency domain: multiply by the conjugate.
    for (r, c) in rec_c.iter_mut().zip(&ref_c) {
        *r *= c.conj();
    }

    ifft.process(&mut rec_c);

    // rustfft does not normalize the inverse transform.
    let norm = 1.0 / n_fft as f32;
    let correlation: Vec<f32> = rec_c.iter().take(n).map(|c| c.re * norm).collect();

    let (lag_index, peak_value) = correlation
        .iter()
        .enumerate()
        .fold((0usize, f32::NEG_INFINITY), |(bi, bv), (i, &v)| {
            if v > bv {
                (i, v)
            } else {
                (bi, bv)
            }
        });

    CorrelationResult {
        lag_index,
        peak_value,
        correlation,
    }
}

/// Greedily extract up to `num_peaks` peaks from `correlation`.
///
/// Each round takes the current global maximum, then zeroes a
/// `min_distance`-wide neighborhood around it so the next round cannot
/// land on the same lobe. Extraction stops early when the remaining
/// maximum is ≤ 0. The returned peaks are amplitude-descending and
/// mutually non-overlapping.
pub fn find_peaks(correlation: &[f32], num_peaks: usize, min_distance: usize) -> Vec<PeakCandidate> {
    let mut peaks = Vec::with_capacity(num_peaks);
    let mut work = correlation.to_vec();

    for _ in 0..num_peaks {
        let Some((index, &amplitude)) = work
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
        else {
            break;
        };

        if amplitude <= 0.0 {
            break;
        }

        peaks.push(PeakCandidate { index, amplitude });

        let start = index.saturating_sub(min_distance);
        let end = (index + min_distance).min(work.len());
        for v in &mut work[start..end] {
            *v = 0.0;
        }
    }

    peaks
}

/// Three-point parabolic sub-sample interpolation around `index`.
///
/// Fits a parabola through the peak and its neighbors and returns the
/// refined (fractional) index and value. At array boundaries the missing
/// neighbor is clamped to the center sample; when the local curvature is
/// numerically degenerate the raw index/value is returned.
pub fn parabolic_interpolate(correlation: &[f32], index: usize) -> (f64, f64) {
    let center = correlation[index] as f64;
    let left = if index >= 1 {
        correlation[index - 1] as f64
    } else {
        center
    };
    let right = if index + 1 < correlation.len() {
        correlation[index + 1] as f64
    } else {
        center
    };

    let denom = 2.0 * (left - 2.0 * center + right);
    if denom.abs() < 1e-12 {
        return (index as f64, center);
    }

    let delta = (left - right) / denom;
    let refined_index = index as f64 + delta;
    let refined_value = center - (left - right) * delta / 4.0;
    (refined_index, refined_value)
}
