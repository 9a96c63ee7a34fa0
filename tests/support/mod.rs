#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dpledger::adapters::sqlite::SqliteStorage;
use dpledger::adapters::tabular::InMemorySource;
use dpledger::application::{AdminService, BudgetLedger, JobService};
use dpledger::config::EngineConfig;
use dpledger::domain::{ColumnMeta, DatasetDescriptor, Datum, SourceDescriptor, Table};
use dpledger::ports::{
    AlertNotice, AlertNotifier, DpError, DpPrimitives, NotifyError, SourceError, TabularSource,
};

/// One call into the noise primitives.
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseCall {
    pub mechanism: &'static str,
    pub sensitivity: f64,
    pub epsilon: f64,
    pub delta: Option<f64>,
}

/// Returns true values unchanged and records every call.
#[derive(Default)]
pub struct RecordingNoise {
    calls: Mutex<Vec<NoiseCall>>,
}

impl RecordingNoise {
    pub fn calls(&self) -> Vec<NoiseCall> {
        self.calls.lock().expect("lock").clone()
    }

    fn record(&self, mechanism: &'static str, sensitivity: f64, epsilon: f64, delta: Option<f64>) {
        self.calls.lock().expect("lock").push(NoiseCall {
            mechanism,
            sensitivity,
            epsilon,
            delta,
        });
    }
}

impl DpPrimitives for RecordingNoise {
    fn laplace(&self, value: f64, sensitivity: f64, epsilon: f64) -> Result<f64, DpError> {
        self.record("laplace", sensitivity, epsilon, None);
        Ok(value)
    }

    fn gaussian(
        &self,
        value: f64,
        sensitivity: f64,
        epsilon: f64,
        delta: f64,
    ) -> Result<f64, DpError> {
        self.record("gaussian", sensitivity, epsilon, Some(delta));
        Ok(value)
    }

    fn exponential(
        &self,
        candidates: &[f64],
        utilities: &[f64],
        sensitivity: f64,
        epsilon: f64,
    ) -> Result<f64, DpError> {
        self.record("exponential", sensitivity, epsilon, None);
        utilities
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| candidates[i])
            .ok_or(DpError::InvalidCandidates)
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<AlertNotice>>,
}

impl RecordingNotifier {
    pub fn notices(&self) -> Vec<AlertNotice> {
        self.notices.lock().expect("lock").clone()
    }
}

impl AlertNotifier for RecordingNotifier {
    fn notify(&self, notice: &AlertNotice) -> Result<(), NotifyError> {
        self.notices.lock().expect("lock").push(notice.clone());
        Ok(())
    }
}

/// Answers after a fixed delay.
pub struct SlowSource(pub Duration);

impl TabularSource for SlowSource {
    fn fetch(&self, _source: &SourceDescriptor) -> Result<Table, SourceError> {
        std::thread::sleep(self.0);
        Ok(survey_table())
    }
}

pub type Jobs<T> = JobService<SqliteStorage, SqliteStorage, T, RecordingNoise, RecordingNotifier>;

pub struct Engine<T: TabularSource + 'static> {
    pub storage: Arc<SqliteStorage>,
    pub source: Arc<T>,
    pub noise: Arc<RecordingNoise>,
    pub notifier: Arc<RecordingNotifier>,
    pub admin: AdminService<SqliteStorage>,
    pub jobs: Jobs<T>,
}

impl<T: TabularSource + 'static> Engine<T> {
    pub fn build(config: &EngineConfig, storage: Arc<SqliteStorage>, source: Arc<T>) -> Self {
        let noise = Arc::new(RecordingNoise::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let ledger = Arc::new(BudgetLedger::new(Arc::clone(&storage)));
        let admin = AdminService::new(config, Arc::clone(&storage), Arc::clone(&ledger));
        let jobs = JobService::new(
            config,
            Arc::clone(&storage),
            ledger,
            Arc::clone(&storage),
            Arc::clone(&source),
            Arc::clone(&noise),
            Arc::clone(&notifier),
        );
        Self {
            storage,
            source,
            noise,
            notifier,
            admin,
            jobs,
        }
    }
}

/// In-memory engine with dataset `survey` registered under budget
/// `survey-budget` with the given allocation.
pub fn engine(epsilon: f64, delta: f64) -> Engine<InMemorySource> {
    let storage = Arc::new(SqliteStorage::in_memory().expect("Should create db"));
    let source = Arc::new(InMemorySource::new());
    source.put("survey", survey_table());

    let engine = Engine::build(&EngineConfig::default(), storage, source);
    engine
        .admin
        .register_dataset_with_budget(&survey_dataset(), epsilon, delta)
        .expect("Should register");
    engine
}

pub fn survey_dataset() -> DatasetDescriptor {
    DatasetDescriptor {
        id: "survey".into(),
        name: "Household survey".into(),
        source: SourceDescriptor::Inline { key: "survey".into() },
        columns: vec![
            ColumnMeta::numeric("age", 0.0, 100.0),
            ColumnMeta::numeric("income", 0.0, 200_000.0),
            ColumnMeta::categorical("city"),
            ColumnMeta::categorical("email").with_pii(true),
        ],
    }
}

pub fn survey_table() -> Table {
    let ages = [23, 35, 41, 29, 62, 55, 38, 47];
    let incomes = [31_000.0, 52_000.0, 61_500.0, 44_000.0, 250_000.0, 72_000.0, 58_000.0, 66_000.0];
    let cities = ["paris", "lyon", "paris", "nice", "lyon", "paris", "nice", "paris"];

    Table::new()
        .with_column("age", ages.iter().map(|a| Datum::Int(*a)).collect())
        .with_column("income", incomes.iter().map(|i| Datum::Real(*i)).collect())
        .with_column("city", cities.iter().map(|c| Datum::Text((*c).to_string())).collect())
        .with_column(
            "email",
            (0..ages.len()).map(|i| Datum::Text(format!("user{i}@example.com"))).collect(),
        )
}
