//! Mechanism dispatcher: turns a resolved sensitivity spec and raw column
//! values into one private release.
//!
//! The dispatcher wires sensitivities, composes epsilon across histogram
//! buckets and post-processes noisy outputs. Sampling itself is delegated to
//! the [`DpPrimitives`] port.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::domain::{
    ColumnBounds, Datum, Mechanism, Metric, NoisePlan, ResultValue, SensitivitySpec,
};
use crate::ports::DpPrimitives;
use crate::{EngineError, Result};

pub struct MechanismDispatcher<D: DpPrimitives> {
    primitives: Arc<D>,
    max_categories: usize,
}

impl<D: DpPrimitives> MechanismDispatcher<D> {
    /// `max_categories` is the cardinality guard for histograms.
    pub fn new(primitives: Arc<D>, max_categories: usize) -> Self {
        Self {
            primitives,
            max_categories,
        }
    }

    /// Release one statistic.
    ///
    /// # Returns
    /// `None` when a histogram column exceeds the cardinality guard and is
    /// skipped.
    ///
    /// # Errors
    /// - `Validation` if Gaussian noise is requested without `0 < delta < 1`
    /// - `UnsupportedQuery` if the exponential mechanism has no candidates
    /// - `Privacy` if a primitive rejects its parameters
    pub fn execute(
        &self,
        spec: &SensitivitySpec,
        epsilon: f64,
        delta: Option<f64>,
        values: &[Datum],
    ) -> Result<Option<ResultValue>> {
        let delta = match spec.mechanism {
            Mechanism::Gaussian => Some(gaussian_delta(delta)?),
            _ => None,
        };

        if spec.plan == NoisePlan::PerBucketCount {
            return self.histogram(spec, epsilon, delta, values);
        }

        let numbers: Vec<f64> = values
            .iter()
            .filter_map(Datum::as_f64)
            .map(|v| spec.bounds.map_or(v, |b| b.clamp(v)))
            .collect();

        let value = match spec.plan {
            NoisePlan::Additive => self.additive(spec, epsilon, delta, &numbers)?,
            NoisePlan::BoundedMean => {
                let b = require_bounds(spec)?;
                self.primitives.bounded_mean(&numbers, b.lower, b.upper, epsilon)?
            }
            NoisePlan::BoundedMedian => {
                let b = require_bounds(spec)?;
                self.primitives
                    .bounded_quantile(&numbers, b.lower, b.upper, 0.5, epsilon)?
            }
            NoisePlan::Selection(utility) => {
                // Every observation is a candidate, so repeated values weigh more.
                let Some(median) = median(&numbers) else {
                    return Err(EngineError::UnsupportedQuery(format!(
                        "{} via exponential mechanism needs at least one observed value",
                        spec.metric
                    )));
                };
                let utilities: Vec<f64> = numbers
                    .iter()
                    .map(|x| utility.score(*x, median))
                    .collect();
                self.primitives
                    .exponential(&numbers, &utilities, spec.sensitivity, epsilon)?
            }
            NoisePlan::PerBucketCount => unreachable_plan()?,
        };

        Ok(Some(ResultValue::Scalar(value)))
    }

    fn noise(
        &self,
        mechanism: Mechanism,
        value: f64,
        sensitivity: f64,
        epsilon: f64,
        delta: Option<f64>,
    ) -> Result<f64> {
        let noisy = match (mechanism, delta) {
            (Mechanism::Gaussian, Some(d)) => {
                self.primitives.gaussian(value, sensitivity, epsilon, d)?
            }
            _ => self.primitives.laplace(value, sensitivity, epsilon)?,
        };
        Ok(noisy)
    }

    fn additive(
        &self,
        spec: &SensitivitySpec,
        epsilon: f64,
        delta: Option<f64>,
        values: &[f64],
    ) -> Result<f64> {
        let n = values.len();
        // Empty columns still get noise around a canonical in-range value.
        let canonical = spec.bounds.map_or(0.0, |b| b.clamp(0.0));

        let truth = match spec.metric {
            Metric::Count => n as f64,
            Metric::Sum => values.iter().sum(),
            Metric::Mean => mean(values).unwrap_or(canonical),
            Metric::Median => median(values).unwrap_or(canonical),
            Metric::Min => values.iter().copied().reduce(f64::min).unwrap_or(canonical),
            Metric::Max => values.iter().copied().reduce(f64::max).unwrap_or(canonical),
            Metric::Variance | Metric::Std => variance(values).unwrap_or(0.0),
            Metric::Histogram => return unreachable_plan(),
        };

        let noisy = self.noise(spec.mechanism, truth, spec.sensitivity, epsilon, delta)?;

        let released = match spec.metric {
            Metric::Count => noisy.round().max(0.0),
            Metric::Sum => noisy,
            Metric::Mean | Metric::Median | Metric::Min | Metric::Max => {
                spec.bounds.map_or(noisy, |b| b.clamp(noisy))
            }
            Metric::Variance | Metric::Std => {
                let ceiling = spec.bounds.map_or(f64::INFINITY, |b| (b.width() / 2.0).powi(2));
                let var = noisy.clamp(0.0, ceiling);
                if spec.metric == Metric::Std {
                    var.sqrt()
                } else {
                    var
                }
            }
            Metric::Histogram => return unreachable_plan(),
        };
        Ok(released)
    }

    fn histogram(
        &self,
        spec: &SensitivitySpec,
        epsilon: f64,
        delta: Option<f64>,
        values: &[Datum],
    ) -> Result<Option<ResultValue>> {
        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        for label in values.iter().filter_map(Datum::label) {
            *counts.entry(label).or_insert(0) += 1;
        }

        let k = counts.len();
        if k > self.max_categories {
            tracing::info!(
                categories = k,
                limit = self.max_categories,
                "Histogram column exceeds cardinality guard; skipping"
            );
            return Ok(None);
        }
        if k == 0 {
            return Ok(Some(ResultValue::Histogram(counts)));
        }

        // Sequential composition: k noisy counts share the query's budget.
        let bucket_epsilon = epsilon / k as f64;
        let bucket_delta = delta.map(|d| d / k as f64);

        let mut released = BTreeMap::new();
        for (label, count) in counts {
            let noisy = self.noise(
                spec.mechanism,
                count as f64,
                spec.sensitivity,
                bucket_epsilon,
                bucket_delta,
            )?;
            released.insert(label, noisy.round().max(0.0) as u64);
        }
        Ok(Some(ResultValue::Histogram(released)))
    }
}

fn gaussian_delta(delta: Option<f64>) -> Result<f64> {
    match delta {
        Some(d) if d.is_finite() && d > 0.0 && d < 1.0 => Ok(d),
        Some(d) => Err(EngineError::Validation(format!(
            "Gaussian mechanism requires 0 < delta < 1, got {d}"
        ))),
        None => Err(EngineError::Validation("Gaussian mechanism requires a delta".into())),
    }
}

fn require_bounds(spec: &SensitivitySpec) -> Result<ColumnBounds> {
    spec.bounds.ok_or_else(|| {
        EngineError::UnsupportedQuery(format!("{} requires declared column bounds", spec.metric))
    })
}

fn unreachable_plan<T>() -> Result<T> {
    Err(EngineError::UnsupportedQuery(
        "histogram metric routed to a scalar noise plan".into(),
    ))
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Population variance.
fn variance(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    Some(values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64)
}
