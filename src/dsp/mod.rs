//! Signal processing for acoustic ranging
//!
//! Pure numerics, no hardware access:
//! - Chirp synthesis and normalization ([`chirp`])
//! - FFT matched-filter cross-correlation ([`correlation`])
//! - Echo-peak selection policies ([`peaks`])
//! - Chirp parameter sizing helpers ([`sizing`])

pub mod chirp;
pub mod correlation;
pub mod peaks;
pub mod sizing;
