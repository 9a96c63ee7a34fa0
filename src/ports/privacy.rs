//! Differential Privacy port: randomization primitives.
//!
//! This trait abstracts noise sampling from the dispatcher, which only wires
//! sensitivities, composes budgets and post-processes releases.

/// Errors that can occur inside a DP primitive.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DpError {
    #[error("Invalid epsilon: {0}")]
    InvalidEpsilon(f64),

    #[error("Invalid delta: {0} (must be in (0, 1))")]
    InvalidDelta(f64),

    #[error("Invalid sensitivity: {0}")]
    InvalidSensitivity(f64),

    #[error("Exponential mechanism needs matching, non-empty candidates and utilities")]
    InvalidCandidates,

    #[error("DP RNG unavailable")]
    RngUnavailable,
}

/// Randomization primitives used to release statistics.
///
/// Implementations must fail closed: invalid parameters return an error and
/// never release an un-noised value.
pub trait DpPrimitives: Send + Sync {
    /// Add Laplace noise with scale `sensitivity / epsilon`.
    ///
    /// # Errors
    /// Returns `DpError` if epsilon or sensitivity is invalid.
    fn laplace(&self, value: f64, sensitivity: f64, epsilon: f64) -> Result<f64, DpError>;

    /// Add Gaussian noise calibrated for (epsilon, delta)-DP.
    ///
    /// # Errors
    /// Returns `DpError` if epsilon, delta or sensitivity is invalid.
    fn gaussian(
        &self,
        value: f64,
        sensitivity: f64,
        epsilon: f64,
        delta: f64,
    ) -> Result<f64, DpError>;

    /// Select one candidate with probability proportional to
    /// `exp(epsilon * utility / (2 * sensitivity))`.
    ///
    /// # Errors
    /// Returns `DpError` on invalid parameters or empty candidates.
    fn exponential(
        &self,
        candidates: &[f64],
        utilities: &[f64],
        sensitivity: f64,
        epsilon: f64,
    ) -> Result<f64, DpError>;

    /// Bounded mean: noisy centered sum over noisy count, each with half the
    /// epsilon. Values are clamped to `[lower, upper]`.
    ///
    /// # Errors
    /// Returns `DpError` from the underlying Laplace calls.
    fn bounded_mean(
        &self,
        values: &[f64],
        lower: f64,
        upper: f64,
        epsilon: f64,
    ) -> Result<f64, DpError> {
        if !epsilon.is_finite() || epsilon <= 0.0 {
            return Err(DpError::InvalidEpsilon(epsilon));
        }
        let midpoint = (lower + upper) / 2.0;
        let half_width = (upper - lower) / 2.0;
        let half_eps = epsilon / 2.0;

        let centered_sum: f64 = values.iter().map(|v| v.clamp(lower, upper) - midpoint).sum();
        let noisy_count = self.laplace(values.len() as f64, 1.0, half_eps)?.max(1.0);
        let noisy_sum = self.laplace(centered_sum, half_width, half_eps)?;

        Ok((midpoint + noisy_sum / noisy_count).clamp(lower, upper))
    }

    /// Bounded quantile via the exponential mechanism over the intervals
    /// between sorted, clamped values. Returns the midpoint of the chosen
    /// interval.
    ///
    /// # Errors
    /// Returns `DpError` from the exponential primitive.
    fn bounded_quantile(
        &self,
        values: &[f64],
        lower: f64,
        upper: f64,
        quantile: f64,
        epsilon: f64,
    ) -> Result<f64, DpError> {
        if !epsilon.is_finite() || epsilon <= 0.0 {
            return Err(DpError::InvalidEpsilon(epsilon));
        }
        let mut points: Vec<f64> = values.iter().map(|v| v.clamp(lower, upper)).collect();
        points.sort_by(f64::total_cmp);
        let n = points.len();
        points.insert(0, lower);
        points.push(upper);

        let target = quantile.clamp(0.0, 1.0) * n as f64;
        let mut candidates = Vec::with_capacity(n + 1);
        let mut utilities = Vec::with_capacity(n + 1);
        for (rank, pair) in points.windows(2).enumerate() {
            let width = pair[1] - pair[0];
            if width <= 0.0 {
                continue;
            }
            // Fold the interval width into the utility so selection is
            // proportional to width * exp(eps * u / 2).
            let utility = -(rank as f64 - target).abs() + 2.0 * width.ln() / epsilon;
            candidates.push((pair[0] + pair[1]) / 2.0);
            utilities.push(utility);
        }

        if candidates.is_empty() {
            return Ok(lower);
        }
        self.exponential(&candidates, &utilities, 1.0, epsilon)
    }
}
