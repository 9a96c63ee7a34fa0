//! Noise adapter: Implementation of DpPrimitives on a ChaCha20 CSPRNG.
//!
//! Provides Laplace, Gaussian and exponential-mechanism sampling.
//!
//! # Mutex Behavior
//!
//! This adapter uses `Mutex` for thread-safe RNG access. A poisoned mutex
//! (from a panic in another thread) fails closed by returning
//! [`DpError::RngUnavailable`]; no statistic is released.

use std::sync::Mutex;

use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Normal};

use crate::ports::{DpError, DpPrimitives};

/// ChaCha20-backed noise source.
pub struct ChaChaNoise {
    rng: Mutex<ChaCha20Rng>,
}

impl ChaChaNoise {
    /// Create a noise source seeded from OS entropy.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(ChaCha20Rng::from_entropy()),
        }
    }

    /// Create a deterministic noise source. Only for reproducible tests.
    #[must_use]
    pub fn with_seed(seed: [u8; 32]) -> Self {
        Self {
            rng: Mutex::new(ChaCha20Rng::from_seed(seed)),
        }
    }

    /// Sample from Laplace(0, scale) as an exponential magnitude with a
    /// random sign.
    fn sample_laplace(&self, scale: f64) -> Result<f64, DpError> {
        let mut rng = self.rng.lock().map_err(|_| DpError::RngUnavailable)?;
        let u01: f64 = rng.gen();
        let negative: bool = rng.gen();
        Ok(laplace_from_uniform(u01, negative, scale))
    }

    fn sample_uniform(&self) -> Result<f64, DpError> {
        let mut rng = self.rng.lock().map_err(|_| DpError::RngUnavailable)?;
        Ok(rng.gen())
    }
}

impl Default for ChaChaNoise {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps `u01` in `[0, 1)` to a Laplace draw. `1 - u01` lies in `(0, 1]`, so
/// the logarithm is always finite.
fn laplace_from_uniform(u01: f64, negative: bool, scale: f64) -> f64 {
    let magnitude = -scale * (1.0 - u01).ln();
    if negative {
        -magnitude
    } else {
        magnitude
    }
}

fn check_epsilon(epsilon: f64) -> Result<(), DpError> {
    if !epsilon.is_finite() || epsilon <= 0.0 {
        tracing::error!("Invalid epsilon: {epsilon}. Refusing to release statistic.");
        return Err(DpError::InvalidEpsilon(epsilon));
    }
    Ok(())
}

fn check_sensitivity(sensitivity: f64) -> Result<(), DpError> {
    if !sensitivity.is_finite() || sensitivity < 0.0 {
        tracing::error!("Invalid sensitivity: {sensitivity}. Refusing to release statistic.");
        return Err(DpError::InvalidSensitivity(sensitivity));
    }
    Ok(())
}

/// Classical Gaussian-mechanism sigma for (epsilon, delta)-DP.
#[must_use]
pub fn gaussian_sigma(sensitivity: f64, epsilon: f64, delta: f64) -> f64 {
    sensitivity * (2.0 * (1.25 / delta).ln()).sqrt() / epsilon
}

impl DpPrimitives for ChaChaNoise {
    fn laplace(&self, value: f64, sensitivity: f64, epsilon: f64) -> Result<f64, DpError> {
        check_epsilon(epsilon)?;
        check_sensitivity(sensitivity)?;
        if sensitivity == 0.0 {
            return Ok(value);
        }
        Ok(value + self.sample_laplace(sensitivity / epsilon)?)
    }

    fn gaussian(
        &self,
        value: f64,
        sensitivity: f64,
        epsilon: f64,
        delta: f64,
    ) -> Result<f64, DpError> {
        check_epsilon(epsilon)?;
        check_sensitivity(sensitivity)?;
        if !delta.is_finite() || delta <= 0.0 || delta >= 1.0 {
            tracing::error!("Invalid delta: {delta}. Refusing to release statistic.");
            return Err(DpError::InvalidDelta(delta));
        }
        if sensitivity == 0.0 {
            return Ok(value);
        }

        let sigma = gaussian_sigma(sensitivity, epsilon, delta);
        let normal = Normal::new(0.0, sigma).map_err(|_| DpError::InvalidSensitivity(sensitivity))?;
        let mut rng = self.rng.lock().map_err(|_| DpError::RngUnavailable)?;
        Ok(value + normal.sample(&mut *rng))
    }

    fn exponential(
        &self,
        candidates: &[f64],
        utilities: &[f64],
        sensitivity: f64,
        epsilon: f64,
    ) -> Result<f64, DpError> {
        check_epsilon(epsilon)?;
        if !sensitivity.is_finite() || sensitivity <= 0.0 {
            return Err(DpError::InvalidSensitivity(sensitivity));
        }
        if candidates.is_empty() || candidates.len() != utilities.len() {
            return Err(DpError::InvalidCandidates);
        }

        // Log-sum-exp normalization keeps large utilities from overflowing.
        let scores: Vec<f64> = utilities
            .iter()
            .map(|u| epsilon * u / (2.0 * sensitivity))
            .collect();
        let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if !max.is_finite() {
            return Err(DpError::InvalidCandidates);
        }
        let weights: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
        let total: f64 = weights.iter().sum();

        let mut target = self.sample_uniform()? * total;
        for (candidate, weight) in candidates.iter().zip(&weights) {
            if target < *weight {
                return Ok(*candidate);
            }
            target -= weight;
        }
        // Rounding can leave a sliver past the last weight.
        candidates.last().copied().ok_or(DpError::InvalidCandidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_laplace_noise() {
        let noise = ChaChaNoise::with_seed([7u8; 32]);
        let noisy = noise.laplace(100.0, 1.0, 0.01).expect("DP noise should work");
        assert!(noisy.is_finite());
        assert_ne!(noisy, 100.0);
    }

    #[test]
    fn test_laplace_fails_closed() {
        let noise = ChaChaNoise::with_seed([1u8; 32]);
        assert_eq!(noise.laplace(1.0, 1.0, 0.0), Err(DpError::InvalidEpsilon(0.0)));
        assert!(matches!(noise.laplace(1.0, f64::NAN, 1.0), Err(DpError::InvalidSensitivity(_))));
    }

    #[test]
    fn test_laplace_finite_at_uniform_edges() {
        let below_one = 1.0 - f64::EPSILON / 2.0;
        for u01 in [0.0, f64::MIN_POSITIVE, 0.5, below_one] {
            for negative in [false, true] {
                let x = laplace_from_uniform(u01, negative, 3.0);
                assert!(x.is_finite(), "u01={u01} negative={negative} gave {x}");
            }
        }
        assert_eq!(laplace_from_uniform(0.0, true, 3.0), 0.0);

        let noise = ChaChaNoise::with_seed([3u8; 32]);
        for _ in 0..10_000 {
            assert!(noise.laplace(0.0, 1.0, 0.5).expect("Should sample").is_finite());
        }
    }

    #[test]
    fn test_laplace_spread_tracks_scale() {
        let noise = ChaChaNoise::with_seed([3u8; 32]);
        let n = 4000;
        let mean_abs: f64 = (0..n)
            .map(|_| noise.laplace(0.0, 1.0, 1.0).expect("noise").abs())
            .sum::<f64>()
            / n as f64;
        // E|X| = b for Laplace(0, b).
        assert!((mean_abs - 1.0).abs() < 0.15, "mean |noise| = {mean_abs}");
    }

    #[test]
    fn test_gaussian_requires_valid_delta() {
        let noise = ChaChaNoise::with_seed([2u8; 32]);
        assert_eq!(noise.gaussian(1.0, 1.0, 1.0, 0.0), Err(DpError::InvalidDelta(0.0)));
        assert_eq!(noise.gaussian(1.0, 1.0, 1.0, 1.0), Err(DpError::InvalidDelta(1.0)));
        assert!(noise.gaussian(1.0, 1.0, 1.0, 1e-5).expect("noise").is_finite());
    }

    #[test]
    fn test_gaussian_sigma() {
        let sigma = gaussian_sigma(1.0, 1.0, 1e-5);
        assert!((sigma - (2.0 * 125_000f64.ln()).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_exponential_prefers_high_utility() {
        let noise = ChaChaNoise::with_seed([9u8; 32]);
        let candidates = [1.0, 2.0, 3.0];
        let utilities = [0.0, 0.0, 1000.0];
        for _ in 0..50 {
            let picked = noise
                .exponential(&candidates, &utilities, 1.0, 1.0)
                .expect("selection");
            assert!((picked - 3.0).abs() < f64::EPSILON);
        }
    }

    #[test]
    fn test_exponential_rejects_empty() {
        let noise = ChaChaNoise::with_seed([9u8; 32]);
        assert_eq!(noise.exponential(&[], &[], 1.0, 1.0), Err(DpError::InvalidCandidates));
        assert_eq!(
            noise.exponential(&[1.0], &[1.0, 2.0], 1.0, 1.0),
            Err(DpError::InvalidCandidates)
        );
    }

    #[test]
    fn test_bounded_mean_stays_in_bounds() {
        let noise = ChaChaNoise::with_seed([5u8; 32]);
        let values = [10.0, 20.0, 30.0, 250.0];
        for _ in 0..100 {
            let mean = noise.bounded_mean(&values, 0.0, 100.0, 0.5).expect("mean");
            assert!((0.0..=100.0).contains(&mean));
        }
    }

    #[test]
    fn test_bounded_quantile_stays_in_bounds() {
        let noise = ChaChaNoise::with_seed([6u8; 32]);
        let values: Vec<f64> = (0..50).map(f64::from).collect();
        let median = noise.bounded_quantile(&values, 0.0, 100.0, 0.5, 5.0).expect("median");
        assert!((0.0..=100.0).contains(&median));

        let degenerate = noise.bounded_quantile(&[], 4.0, 4.0, 0.5, 1.0).expect("median");
        assert!((degenerate - 4.0).abs() < f64::EPSILON);
    }
}
