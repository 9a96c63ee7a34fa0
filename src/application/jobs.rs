//! Job service: runs a DP analysis job end to end.
//!
//! A job is validated, checked against the guardrail, charged to its budget,
//! then executed column by column. Results are buffered and persisted
//! together with the budget commit in one transaction, so a completed job
//! always has its full result set and a committed debit always has results.
//!
//! Rejections before the reservation return `Err` and leave no record. Any
//! failure after it releases the reservation and returns the job in the
//! `Failed` state.

use std::sync::Arc;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::domain::sensitivity::{self, ColumnProfile};
use crate::domain::{
    ColumnMeta, DatasetDescriptor, Datum, Job, JobRequest, JobResult, JobStatus, Mechanism, Metric,
    Reservation, Table,
};
use crate::ports::{AlertNotifier, DatasetCatalog, DpPrimitives, Storage, TabularSource};
use crate::{EngineError, Result};

use super::alerts::AlertEvaluator;
use super::dispatcher::MechanismDispatcher;
use super::fetch::{fetch_with_timeout, FetchGate};
use super::guardrail::PolicyGuardrail;
use super::ledger::BudgetLedger;

/// A request that passed validation.
struct ValidatedJob {
    dataset: DatasetDescriptor,
    columns: Vec<String>,
    metrics: Vec<Metric>,
    delta: Option<f64>,
}

pub struct JobService<S, C, T, D, N>
where
    S: Storage,
    C: DatasetCatalog,
    T: TabularSource + 'static,
    D: DpPrimitives,
    N: AlertNotifier,
{
    storage: Arc<S>,
    catalog: Arc<C>,
    source: Arc<T>,
    guardrail: PolicyGuardrail<S>,
    ledger: Arc<BudgetLedger<S>>,
    dispatcher: MechanismDispatcher<D>,
    alerts: AlertEvaluator<S, N>,
    fetch_timeout: Duration,
    fetch_gate: FetchGate,
}

impl<S, C, T, D, N> JobService<S, C, T, D, N>
where
    S: Storage,
    C: DatasetCatalog,
    T: TabularSource + 'static,
    D: DpPrimitives,
    N: AlertNotifier,
{
    /// Create a job service. `ledger` should be shared with any other
    /// service that mutates the same budgets.
    pub fn new(
        config: &EngineConfig,
        storage: Arc<S>,
        ledger: Arc<BudgetLedger<S>>,
        catalog: Arc<C>,
        source: Arc<T>,
        primitives: Arc<D>,
        notifier: Arc<N>,
    ) -> Self {
        Self {
            guardrail: PolicyGuardrail::new(
                Arc::clone(&storage),
                config.default_max_epsilon_per_job,
            ),
            dispatcher: MechanismDispatcher::new(primitives, config.histogram_max_categories),
            alerts: AlertEvaluator::new(Arc::clone(&storage), notifier),
            fetch_timeout: config.fetch_timeout(),
            fetch_gate: FetchGate::new(config.max_fetch_workers),
            storage,
            catalog,
            source,
            ledger,
        }
    }

    /// Submit and run a job.
    ///
    /// # Errors
    /// - `Validation`, `NotFound`: malformed request or unknown dataset/budget
    /// - `PolicyViolation`: epsilon above the organization ceiling
    /// - `InsufficientBudget`: the budget cannot cover the job
    ///
    /// Failures after the budget is reserved are reported through the
    /// returned job's `status`, `error` and `error_kind`.
    pub fn submit(&self, request: JobRequest) -> Result<Job> {
        let validated = self.validate(&request)?;
        self.guardrail.check_job_epsilon(request.epsilon)?;

        let reservation = match request.budget_id.as_deref() {
            Some(budget_id) => Some(self.reserve(
                budget_id,
                &validated.dataset.id,
                &request,
                validated.delta,
            )?),
            None => None,
        };

        let mut job = Job::start(&request, validated.columns.clone());
        job.metrics.clone_from(&validated.metrics);
        job.delta = validated.delta;

        if let Err(e) = self
            .storage
            .insert_job(&job)
            .map_err(|e| EngineError::Storage(e.into()))
        {
            if let Some(r) = &reservation {
                self.release_quietly(r);
            }
            return Err(e);
        }

        tracing::info!(
            job_id = %job.id,
            dataset_id = %job.dataset_id,
            epsilon = job.epsilon,
            mechanism = %job.mechanism,
            "Job started"
        );

        let results = match self.run(&job, &validated) {
            Ok(results) => results,
            Err(e) => return Ok(self.abandon(job, reservation.as_ref(), &e)),
        };

        job.status = JobStatus::Completed;
        job.finished_at = Some(chrono::Utc::now());
        if let Err(e) = self.ledger.commit(&job, &results, reservation.as_ref()) {
            return Ok(self.abandon(job, reservation.as_ref(), &e));
        }
        job.results = results;

        tracing::info!(job_id = %job.id, results = job.results.len(), "Job completed");

        if let Some(budget_id) = job.budget_id.as_deref() {
            self.alerts.evaluate(budget_id);
        }
        Ok(job)
    }

    /// Load a job with its results.
    ///
    /// # Errors
    /// Returns `NotFound` for unknown jobs.
    pub fn get_job(&self, job_id: &str) -> Result<Job> {
        self.storage
            .load_job(job_id)
            .map_err(|e| EngineError::Storage(e.into()))?
            .ok_or_else(|| EngineError::NotFound(format!("job {job_id}")))
    }

    /// All jobs, newest first. Result rows are not loaded.
    ///
    /// # Errors
    /// Returns error if storage fails.
    pub fn list_jobs(&self) -> Result<Vec<Job>> {
        self.storage
            .list_jobs()
            .map_err(|e| EngineError::Storage(e.into()))
    }

    fn validate(&self, request: &JobRequest) -> Result<ValidatedJob> {
        if request.metrics.is_empty() {
            return Err(EngineError::Validation("at least one metric is required".into()));
        }
        if !request.epsilon.is_finite() || request.epsilon <= 0.0 {
            return Err(EngineError::Validation(format!(
                "epsilon must be a positive number, got {}",
                request.epsilon
            )));
        }

        let delta = match (request.mechanism, request.delta) {
            (Mechanism::Gaussian, Some(d)) if d.is_finite() && d > 0.0 && d < 1.0 => Some(d),
            (Mechanism::Gaussian, Some(d)) => {
                return Err(EngineError::Validation(format!(
                    "Gaussian mechanism requires 0 < delta < 1, got {d}"
                )))
            }
            (Mechanism::Gaussian, None) => {
                return Err(EngineError::Validation("Gaussian mechanism requires a delta".into()))
            }
            (_, Some(d)) if !(d.is_finite() && (0.0..1.0).contains(&d)) => {
                return Err(EngineError::Validation(format!("delta must be in [0, 1), got {d}")))
            }
            (_, d) => d,
        };

        let dataset = self
            .catalog
            .get_dataset(&request.dataset_id)
            .map_err(|e| EngineError::DataUnavailable(e.to_string()))?
            .ok_or_else(|| EngineError::NotFound(format!("dataset {}", request.dataset_id)))?;

        let columns: Vec<String> = match &request.columns {
            Some(requested) => {
                let mut selected: Vec<String> = Vec::with_capacity(requested.len());
                for name in requested {
                    if dataset.column(name).is_none() {
                        return Err(EngineError::Validation(format!(
                            "dataset {} has no column '{name}'",
                            dataset.id
                        )));
                    }
                    if !selected.contains(name) {
                        selected.push(name.clone());
                    }
                }
                selected
            }
            None => dataset
                .columns
                .iter()
                .filter(|c| !c.is_pii)
                .map(|c| c.name.clone())
                .collect(),
        };
        if columns.is_empty() {
            return Err(EngineError::Validation(format!(
                "no analysable columns selected on dataset {}",
                dataset.id
            )));
        }

        let mut metrics: Vec<Metric> = Vec::with_capacity(request.metrics.len());
        for metric in &request.metrics {
            if !metrics.contains(metric) {
                metrics.push(*metric);
            }
        }

        Ok(ValidatedJob {
            dataset,
            columns,
            metrics,
            delta,
        })
    }

    fn reserve(
        &self,
        budget_id: &str,
        dataset_id: &str,
        request: &JobRequest,
        delta: Option<f64>,
    ) -> Result<Reservation> {
        let budget = self
            .storage
            .load_budget(budget_id)
            .map_err(|e| EngineError::Storage(e.into()))?
            .ok_or_else(|| EngineError::NotFound(format!("budget {budget_id}")))?;
        if budget.dataset_id != dataset_id {
            return Err(EngineError::Validation(format!(
                "budget {budget_id} belongs to dataset {}, not {dataset_id}",
                budget.dataset_id
            )));
        }
        self.ledger.reserve(budget_id, request.epsilon, delta.unwrap_or(0.0))
    }

    /// Fetch data and compute every (column, metric) release into a buffer.
    fn run(&self, job: &Job, validated: &ValidatedJob) -> Result<Vec<JobResult>> {
        let table = fetch_with_timeout(
            Arc::clone(&self.source),
            &validated.dataset.source,
            self.fetch_timeout,
            &self.fetch_gate,
        )?;

        let mut results = Vec::with_capacity(job.columns.len() * job.metrics.len());
        for name in &job.columns {
            let meta = validated
                .dataset
                .column(name)
                .ok_or_else(|| EngineError::Validation(format!("unknown column '{name}'")))?;
            let values = column_values(&table, name)?;

            for metric in &job.metrics {
                let profile = profile_for(meta, *metric, values);
                let spec = sensitivity::resolve(*metric, job.mechanism, &profile)
                    .map_err(|e| EngineError::UnsupportedQuery(e.to_string()))?;
                if spec.is_fallback() {
                    tracing::info!(
                        column = %name,
                        metric = %metric,
                        requested = %spec.requested,
                        used = %spec.mechanism,
                        "Mechanism fallback"
                    );
                }

                match self.dispatcher.execute(&spec, job.epsilon, job.delta, values)? {
                    Some(value) => results.push(JobResult::new(&job.id, *metric, name, value)),
                    None => tracing::info!(column = %name, metric = %metric, "Column skipped"),
                }
            }
        }
        Ok(results)
    }

    /// Release the reservation and persist the job as failed.
    fn abandon(&self, mut job: Job, reservation: Option<&Reservation>, error: &EngineError) -> Job {
        if let Some(r) = reservation {
            self.release_quietly(r);
        }

        job.status = JobStatus::Failed;
        job.error = Some(error.to_string());
        job.error_kind = Some(error.kind());
        job.finished_at = Some(chrono::Utc::now());
        job.results.clear();

        if let Err(e) = self.storage.fail_job(&job, &error.to_string(), error.kind()) {
            tracing::error!(job_id = %job.id, "Could not persist job failure: {e}");
        }
        tracing::warn!(job_id = %job.id, kind = %error.kind(), "Job failed: {error}");
        job
    }

    fn release_quietly(&self, reservation: &Reservation) {
        if let Err(e) = self.ledger.release(reservation) {
            tracing::error!(reservation_id = %reservation.id, "Could not release reservation: {e}");
        }
    }
}

fn column_values<'t>(table: &'t Table, name: &str) -> Result<&'t [Datum]> {
    table
        .column(name)
        .ok_or_else(|| {
            EngineError::DataUnavailable(format!("column '{name}' is missing from the source data"))
        })
}

fn profile_for(meta: &ColumnMeta, metric: Metric, values: &[Datum]) -> ColumnProfile {
    let non_null = if metric.is_histogram() {
        values.iter().filter(|v| !v.is_null()).count()
    } else {
        values.iter().filter(|v| v.as_f64().is_some()).count()
    };
    ColumnProfile::from_meta(meta, non_null)
}
