mod support;

use std::sync::Arc;
use std::thread;

use dpledger::adapters::sqlite::SqliteStorage;
use dpledger::adapters::tabular::InMemorySource;
use dpledger::config::EngineConfig;
use dpledger::domain::{to_units, Policy};
use dpledger::ports::Storage;
use dpledger::{ErrorKind, JobRequest, JobStatus, Metric};

use support::{engine, survey_dataset, survey_table, Engine};

#[test]
fn concurrent_jobs_never_overdraw_a_budget() {
    let engine = engine(1.0, 0.0);

    let outcomes: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..10)
            .map(|_| {
                s.spawn(|| {
                    engine.jobs.submit(
                        JobRequest::new("survey", vec![Metric::Count], 0.3)
                            .with_budget("survey-budget")
                            .with_columns(["age"]),
                    )
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().expect("thread panicked")).collect()
    });

    let completed = outcomes
        .iter()
        .filter(|o| matches!(o, Ok(job) if job.status == JobStatus::Completed))
        .count();
    let refused = outcomes
        .iter()
        .filter(|o| matches!(o, Err(e) if e.kind() == ErrorKind::InsufficientBudget))
        .count();
    assert_eq!(completed, 3);
    assert_eq!(refused, 7);

    let budget = engine
        .storage
        .load_budget("survey-budget")
        .expect("Should load")
        .expect("Should exist");
    assert_eq!(budget.consumed_epsilon_units, 3 * to_units(0.3));
    assert!(budget.consumed_epsilon_units <= budget.allocated_epsilon_units);
}

#[test]
fn budgets_are_accounted_independently() {
    let storage = Arc::new(SqliteStorage::in_memory().expect("Should create db"));
    let source = Arc::new(InMemorySource::new());
    let engine = Engine::build(&EngineConfig::default(), storage, Arc::clone(&source));

    for id in ["north", "south"] {
        let mut dataset = survey_dataset();
        dataset.id = id.into();
        dataset.source = dpledger::domain::SourceDescriptor::Inline { key: id.into() };
        source.put(id, survey_table());
        engine
            .admin
            .register_dataset_with_budget(&dataset, 1.0, 0.0)
            .expect("Should register");
    }

    thread::scope(|s| {
        for id in ["north", "south"] {
            for _ in 0..4 {
                let engine = &engine;
                s.spawn(move || {
                    let _ = engine.jobs.submit(
                        JobRequest::new(id, vec![Metric::Count], 0.25)
                            .with_budget(format!("{id}-budget"))
                            .with_columns(["age"]),
                    );
                });
            }
        }
    });

    for id in ["north", "south"] {
        let status = engine
            .admin
            .get_budget_status(&format!("{id}-budget"))
            .expect("Should read");
        assert!((status.consumed_epsilon - 1.0).abs() < 1e-12, "{id}: {status:?}");
    }
}

#[test]
fn policy_row_is_created_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("policy.db");
    let storage = Arc::new(SqliteStorage::new(&path).expect("Should open"));

    let ceilings: Vec<f64> = thread::scope(|s| {
        let handles: Vec<_> = (1..=8)
            .map(|i| {
                let storage = Arc::clone(&storage);
                s.spawn(move || {
                    storage
                        .load_or_init_policy(Policy {
                            max_epsilon_per_job: f64::from(i),
                        })
                        .expect("Should init")
                        .max_epsilon_per_job
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().expect("thread panicked")).collect()
    });

    // Every caller sees the single winning row.
    assert!(ceilings.windows(2).all(|w| (w[0] - w[1]).abs() < f64::EPSILON));
}
