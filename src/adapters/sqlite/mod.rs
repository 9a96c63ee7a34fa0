//! SQLite adapter: Implementation of Storage and DatasetCatalog.
//!
//! Provides local persistence for the policy row, datasets, budgets,
//! reservations, jobs, results and alerts.
//!
//! # Atomicity
//!
//! Budget debits are a single guarded `UPDATE` (the affordability check is in
//! the `WHERE` clause), so the check and the write cannot interleave with
//! another writer. Job completion, result insertion and reservation commit run
//! in one transaction.
//!
//! # Mutex Behavior
//!
//! The connection is protected by `Mutex`. A poisoned mutex fails closed with
//! [`StorageError::LockPoisoned`] rather than touching budget state.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;

use crate::domain::{
    Alert, Budget, DatasetDescriptor, Job, JobResult, JobStatus, Mechanism, Metric, Policy,
    Reservation, ReservationState, ResultValue,
};
use crate::ports::{DatasetCatalog, SourceError, Storage};
use crate::ErrorKind;

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// SQLite storage adapter.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open (or create) the database at `path`.
    ///
    /// # Errors
    /// Returns error if database cannot be opened or initialized.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    /// Create an in-memory SQLite database (for testing).
    ///
    /// # Errors
    /// Returns error if database cannot be created.
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    /// Initialize the database schema.
    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;

        conn.execute_batch(
            r"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS policy (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                max_epsilon_per_job REAL NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS datasets (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                source TEXT NOT NULL,
                columns TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS budgets (
                id TEXT PRIMARY KEY,
                dataset_id TEXT NOT NULL UNIQUE,
                allocated_epsilon INTEGER NOT NULL,
                allocated_delta INTEGER NOT NULL,
                consumed_epsilon INTEGER NOT NULL DEFAULT 0,
                consumed_delta INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS reservations (
                id TEXT PRIMARY KEY,
                budget_id TEXT NOT NULL,
                epsilon INTEGER NOT NULL,
                delta INTEGER NOT NULL,
                state TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                dataset_id TEXT NOT NULL,
                budget_id TEXT,
                epsilon REAL NOT NULL,
                delta REAL,
                mechanism TEXT NOT NULL,
                columns TEXT NOT NULL,
                metrics TEXT NOT NULL,
                status TEXT NOT NULL,
                error TEXT,
                error_kind TEXT,
                created_at TEXT NOT NULL,
                finished_at TEXT
            );

            CREATE TABLE IF NOT EXISTS job_results (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                analysis_type TEXT NOT NULL,
                column_name TEXT NOT NULL,
                result TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS alerts (
                id TEXT PRIMARY KEY,
                budget_id TEXT NOT NULL,
                threshold REAL NOT NULL,
                recipient TEXT NOT NULL,
                triggered INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_created
                ON jobs(created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_results_job
                ON job_results(job_id);
            CREATE INDEX IF NOT EXISTS idx_reservations_budget
                ON reservations(budget_id, state);
            ",
        )?;

        Ok(())
    }

    /// Load all registered datasets.
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    pub fn list_datasets(&self) -> Result<Vec<DatasetDescriptor>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, name, source, columns FROM datasets ORDER BY id")?;
        let datasets = stmt
            .query_map([], row_to_dataset)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(datasets)
    }

    fn now() -> String {
        chrono::Utc::now().to_rfc3339()
    }
}

fn parse_timestamp(s: &str) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .unwrap_or_else(|_| chrono::Utc::now())
}

/// Read a JSON-encoded TEXT column.
fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Read a TEXT column through `FromStr`.
fn parsed_column<T: FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn row_to_dataset(row: &Row<'_>) -> rusqlite::Result<DatasetDescriptor> {
    Ok(DatasetDescriptor {
        id: row.get(0)?,
        name: row.get(1)?,
        source: json_column(row, 2)?,
        columns: json_column(row, 3)?,
    })
}

fn row_to_budget(row: &Row<'_>) -> rusqlite::Result<Budget> {
    Ok(Budget {
        id: row.get(0)?,
        dataset_id: row.get(1)?,
        allocated_epsilon_units: row.get(2)?,
        allocated_delta_units: row.get(3)?,
        consumed_epsilon_units: row.get(4)?,
        consumed_delta_units: row.get(5)?,
    })
}

fn row_to_alert(row: &Row<'_>) -> rusqlite::Result<Alert> {
    let triggered: i64 = row.get(4)?;
    Ok(Alert {
        id: row.get(0)?,
        budget_id: row.get(1)?,
        threshold: row.get(2)?,
        recipient: row.get(3)?,
        triggered: triggered != 0,
    })
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let status_str: String = row.get(8)?;
    let status = JobStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            8,
            Type::Text,
            format!("unknown job status '{status_str}'").into(),
        )
    })?;
    let error_kind: Option<String> = row.get(10)?;
    let created_at: String = row.get(11)?;
    let finished_at: Option<String> = row.get(12)?;

    Ok(Job {
        id: row.get(0)?,
        dataset_id: row.get(1)?,
        budget_id: row.get(2)?,
        epsilon: row.get(3)?,
        delta: row.get(4)?,
        mechanism: parsed_column::<Mechanism>(row, 5)?,
        columns: json_column(row, 6)?,
        metrics: json_column(row, 7)?,
        status,
        error: row.get(9)?,
        error_kind: error_kind.as_deref().map(ErrorKind::parse),
        created_at: parse_timestamp(&created_at),
        finished_at: finished_at.as_deref().map(parse_timestamp),
        results: Vec::new(),
    })
}

fn row_to_result(row: &Row<'_>) -> rusqlite::Result<JobResult> {
    Ok(JobResult {
        id: row.get(0)?,
        job_id: row.get(1)?,
        analysis_type: parsed_column::<Metric>(row, 2)?,
        column_name: row.get(3)?,
        result: json_column::<ResultValue>(row, 4)?,
    })
}

const BUDGET_COLUMNS: &str =
    "id, dataset_id, allocated_epsilon, allocated_delta, consumed_epsilon, consumed_delta";

const JOB_COLUMNS: &str = "id, dataset_id, budget_id, epsilon, delta, mechanism, columns, metrics, \
     status, error, error_kind, created_at, finished_at";

fn insert_budget_row(conn: &Connection, budget: &Budget, now: &str) -> rusqlite::Result<()> {
    conn.execute(
        r"
        INSERT INTO budgets (
            id, dataset_id, allocated_epsilon, allocated_delta,
            consumed_epsilon, consumed_delta, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ",
        params![
            budget.id,
            budget.dataset_id,
            budget.allocated_epsilon_units,
            budget.allocated_delta_units,
            budget.consumed_epsilon_units,
            budget.consumed_delta_units,
            now,
        ],
    )?;
    Ok(())
}

fn budget_exists(conn: &Connection, budget_id: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) FROM budgets WHERE id = ?1",
        params![budget_id],
        |row| row.get::<_, i64>(0),
    )
    .map(|n| n > 0)
}

impl Storage for SqliteStorage {
    type Error = StorageError;

    fn load_or_init_policy(&self, default: Policy) -> Result<Policy, Self::Error> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO policy (id, max_epsilon_per_job, updated_at) VALUES (1, ?1, ?2)",
            params![default.max_epsilon_per_job, Self::now()],
        )?;
        if inserted > 0 {
            tracing::info!(
                max_epsilon_per_job = default.max_epsilon_per_job,
                "Initialized guardrail policy"
            );
        }

        let max_epsilon_per_job: f64 = conn.query_row(
            "SELECT max_epsilon_per_job FROM policy WHERE id = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(Policy { max_epsilon_per_job })
    }

    fn save_policy(&self, policy: &Policy) -> Result<(), Self::Error> {
        let conn = self.conn()?;
        conn.execute(
            r"
            INSERT INTO policy (id, max_epsilon_per_job, updated_at) VALUES (1, ?1, ?2)
            ON CONFLICT(id) DO UPDATE SET
                max_epsilon_per_job = excluded.max_epsilon_per_job,
                updated_at = excluded.updated_at
            ",
            params![policy.max_epsilon_per_job, Self::now()],
        )?;
        Ok(())
    }

    fn insert_dataset(
        &self,
        dataset: &DatasetDescriptor,
        budget: &Budget,
    ) -> Result<(), Self::Error> {
        let source = serde_json::to_string(&dataset.source)?;
        let columns = serde_json::to_string(&dataset.columns)?;
        let now = Self::now();

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let exists: i64 = tx.query_row(
            "SELECT COUNT(*) FROM datasets WHERE id = ?1",
            params![dataset.id],
            |row| row.get(0),
        )?;
        if exists > 0 {
            return Err(StorageError::Conflict(format!(
                "dataset {} already registered",
                dataset.id
            )));
        }
        if budget_exists(&tx, &budget.id)? {
            return Err(StorageError::Conflict(format!("budget {} already exists", budget.id)));
        }

        tx.execute(
            "INSERT INTO datasets (id, name, source, columns, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![dataset.id, dataset.name, source, columns, now],
        )?;
        insert_budget_row(&tx, budget, &now)?;
        tx.commit()?;

        tracing::info!(dataset_id = %dataset.id, budget_id = %budget.id, "Registered dataset");
        Ok(())
    }

    fn insert_budget(&self, budget: &Budget) -> Result<(), Self::Error> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let dataset: i64 = tx.query_row(
            "SELECT COUNT(*) FROM datasets WHERE id = ?1",
            params![budget.dataset_id],
            |row| row.get(0),
        )?;
        if dataset == 0 {
            return Err(StorageError::NotFound(format!("dataset {}", budget.dataset_id)));
        }
        let owned: i64 = tx.query_row(
            "SELECT COUNT(*) FROM budgets WHERE dataset_id = ?1",
            params![budget.dataset_id],
            |row| row.get(0),
        )?;
        if owned > 0 {
            return Err(StorageError::Conflict(format!(
                "dataset {} already has a budget",
                budget.dataset_id
            )));
        }
        if budget_exists(&tx, &budget.id)? {
            return Err(StorageError::Conflict(format!("budget {} already exists", budget.id)));
        }

        insert_budget_row(&tx, budget, &Self::now())?;
        tx.commit()?;

        tracing::info!(dataset_id = %budget.dataset_id, budget_id = %budget.id, "Created budget");
        Ok(())
    }

    fn delete_dataset(&self, dataset_id: &str) -> Result<(), Self::Error> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let jobs: i64 = tx.query_row(
            "SELECT COUNT(*) FROM jobs WHERE dataset_id = ?1",
            params![dataset_id],
            |row| row.get(0),
        )?;
        if jobs > 0 {
            return Err(StorageError::Conflict(format!(
                "dataset {dataset_id} is referenced by {jobs} job(s)"
            )));
        }

        tx.execute(
            "DELETE FROM alerts WHERE budget_id IN (SELECT id FROM budgets WHERE dataset_id = ?1)",
            params![dataset_id],
        )?;
        tx.execute(
            "DELETE FROM reservations \
             WHERE budget_id IN (SELECT id FROM budgets WHERE dataset_id = ?1)",
            params![dataset_id],
        )?;
        tx.execute("DELETE FROM budgets WHERE dataset_id = ?1", params![dataset_id])?;
        let removed = tx.execute("DELETE FROM datasets WHERE id = ?1", params![dataset_id])?;
        if removed == 0 {
            return Err(StorageError::NotFound(format!("dataset {dataset_id}")));
        }
        tx.commit()?;

        tracing::info!(dataset_id, "Deleted dataset");
        Ok(())
    }

    fn load_budget(&self, budget_id: &str) -> Result<Option<Budget>, Self::Error> {
        let conn = self.conn()?;
        let budget = conn
            .query_row(
                &format!("SELECT {BUDGET_COLUMNS} FROM budgets WHERE id = ?1"),
                params![budget_id],
                row_to_budget,
            )
            .optional()?;
        Ok(budget)
    }

    fn budget_for_dataset(&self, dataset_id: &str) -> Result<Option<Budget>, Self::Error> {
        let conn = self.conn()?;
        let budget = conn
            .query_row(
                &format!("SELECT {BUDGET_COLUMNS} FROM budgets WHERE dataset_id = ?1"),
                params![dataset_id],
                row_to_budget,
            )
            .optional()?;
        Ok(budget)
    }

    fn list_budgets(&self) -> Result<Vec<Budget>, Self::Error> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {BUDGET_COLUMNS} FROM budgets ORDER BY id"))?;
        let budgets = stmt
            .query_map([], row_to_budget)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(budgets)
    }

    fn try_reserve(&self, reservation: &Reservation) -> Result<bool, Self::Error> {
        let now = Self::now();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let debited = tx.execute(
            r"
            UPDATE budgets SET
                consumed_epsilon = consumed_epsilon + ?2,
                consumed_delta = consumed_delta + ?3,
                updated_at = ?4
            WHERE id = ?1
              AND consumed_epsilon + ?2 <= allocated_epsilon
              AND consumed_delta + ?3 <= allocated_delta
            ",
            params![reservation.budget_id, reservation.epsilon_units, reservation.delta_units, now],
        )?;

        if debited == 0 {
            if !budget_exists(&tx, &reservation.budget_id)? {
                return Err(StorageError::NotFound(format!("budget {}", reservation.budget_id)));
            }
            return Ok(false);
        }

        tx.execute(
            r"
            INSERT INTO reservations (id, budget_id, epsilon, delta, state, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
            params![
                reservation.id,
                reservation.budget_id,
                reservation.epsilon_units,
                reservation.delta_units,
                ReservationState::Pending.as_str(),
                now,
            ],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn release_reservation(&self, reservation_id: &str) -> Result<bool, Self::Error> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let row: Option<(String, i64, i64, String)> = tx
            .query_row(
                "SELECT budget_id, epsilon, delta, state FROM reservations WHERE id = ?1",
                params![reservation_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        let Some((budget_id, epsilon, delta, state)) = row else {
            return Ok(false);
        };
        if state != ReservationState::Pending.as_str() {
            return Ok(false);
        }

        tx.execute(
            r"
            UPDATE budgets SET
                consumed_epsilon = MAX(consumed_epsilon - ?2, 0),
                consumed_delta = MAX(consumed_delta - ?3, 0),
                updated_at = ?4
            WHERE id = ?1
            ",
            params![budget_id, epsilon, delta, Self::now()],
        )?;
        tx.execute(
            "UPDATE reservations SET state = ?2 WHERE id = ?1",
            params![reservation_id, ReservationState::Released.as_str()],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn reset_budget(&self, budget_id: &str) -> Result<(), Self::Error> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let updated = tx.execute(
            "UPDATE budgets SET consumed_epsilon = 0, consumed_delta = 0, updated_at = ?2 \
             WHERE id = ?1",
            params![budget_id, Self::now()],
        )?;
        if updated == 0 {
            return Err(StorageError::NotFound(format!("budget {budget_id}")));
        }
        // In-flight debits were wiped with the totals; a later release must not subtract again.
        tx.execute(
            "UPDATE reservations SET state = ?2 WHERE budget_id = ?1 AND state = ?3",
            params![
                budget_id,
                ReservationState::Released.as_str(),
                ReservationState::Pending.as_str()
            ],
        )?;
        tx.execute("UPDATE alerts SET triggered = 0 WHERE budget_id = ?1", params![budget_id])?;
        tx.commit()?;

        tracing::warn!(budget_id, "Budget reset");
        Ok(())
    }

    fn allocate_budget(
        &self,
        budget_id: &str,
        epsilon_units: i64,
        delta_units: i64,
    ) -> Result<Budget, Self::Error> {
        let conn = self.conn()?;
        let updated = conn.execute(
            r"
            UPDATE budgets SET
                allocated_epsilon = allocated_epsilon + ?2,
                allocated_delta = allocated_delta + ?3,
                updated_at = ?4
            WHERE id = ?1
            ",
            params![budget_id, epsilon_units, delta_units, Self::now()],
        )?;
        if updated == 0 {
            return Err(StorageError::NotFound(format!("budget {budget_id}")));
        }
        let budget = conn.query_row(
            &format!("SELECT {BUDGET_COLUMNS} FROM budgets WHERE id = ?1"),
            params![budget_id],
            row_to_budget,
        )?;
        Ok(budget)
    }

    fn delete_budget(&self, budget_id: &str) -> Result<(), Self::Error> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let jobs: i64 = tx.query_row(
            "SELECT COUNT(*) FROM jobs WHERE budget_id = ?1",
            params![budget_id],
            |row| row.get(0),
        )?;
        if jobs > 0 {
            return Err(StorageError::Conflict(format!(
                "budget {budget_id} is referenced by {jobs} job(s)"
            )));
        }

        tx.execute("DELETE FROM alerts WHERE budget_id = ?1", params![budget_id])?;
        tx.execute("DELETE FROM reservations WHERE budget_id = ?1", params![budget_id])?;
        let removed = tx.execute("DELETE FROM budgets WHERE id = ?1", params![budget_id])?;
        if removed == 0 {
            return Err(StorageError::NotFound(format!("budget {budget_id}")));
        }
        tx.commit()?;
        Ok(())
    }

    fn insert_job(&self, job: &Job) -> Result<(), Self::Error> {
        let columns = serde_json::to_string(&job.columns)?;
        let metrics = serde_json::to_string(&job.metrics)?;
        let conn = self.conn()?;

        conn.execute(
            &format!(
                "INSERT INTO jobs ({JOB_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ),
            params![
                job.id,
                job.dataset_id,
                job.budget_id,
                job.epsilon,
                job.delta,
                job.mechanism.as_str(),
                columns,
                metrics,
                job.status.as_str(),
                job.error,
                job.error_kind.map(|k| k.as_str()),
                job.created_at.to_rfc3339(),
                job.finished_at.map(|t| t.to_rfc3339()),
            ],
        )?;

        tracing::debug!("Saved job {} to storage", job.id);
        Ok(())
    }

    fn complete_job(
        &self,
        job: &Job,
        results: &[JobResult],
        reservation: Option<&Reservation>,
    ) -> Result<(), Self::Error> {
        let encoded = results
            .iter()
            .map(|r| serde_json::to_string(&r.result))
            .collect::<Result<Vec<_>, _>>()?;
        let finished_at = job.finished_at.unwrap_or_else(chrono::Utc::now).to_rfc3339();

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let updated = tx.execute(
            "UPDATE jobs SET status = ?2, error = NULL, error_kind = NULL, finished_at = ?3 \
             WHERE id = ?1",
            params![job.id, JobStatus::Completed.as_str(), finished_at],
        )?;
        if updated == 0 {
            return Err(StorageError::NotFound(format!("job {}", job.id)));
        }

        {
            let mut stmt = tx.prepare(
                "INSERT INTO job_results (id, job_id, analysis_type, column_name, result) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (result, json) in results.iter().zip(&encoded) {
                stmt.execute(params![
                    result.id,
                    job.id,
                    result.analysis_type.as_str(),
                    result.column_name,
                    json,
                ])?;
            }
        }

        if let Some(reservation) = reservation {
            tx.execute(
                "UPDATE reservations SET state = ?2 WHERE id = ?1 AND state = ?3",
                params![
                    reservation.id,
                    ReservationState::Committed.as_str(),
                    ReservationState::Pending.as_str()
                ],
            )?;
        }
        tx.commit()?;

        tracing::debug!(job_id = %job.id, results = results.len(), "Job completed");
        Ok(())
    }

    fn fail_job(&self, job: &Job, error: &str, kind: ErrorKind) -> Result<(), Self::Error> {
        let finished_at = job.finished_at.unwrap_or_else(chrono::Utc::now).to_rfc3339();
        let conn = self.conn()?;
        conn.execute(
            "UPDATE jobs SET status = ?2, error = ?3, error_kind = ?4, finished_at = ?5 \
             WHERE id = ?1",
            params![job.id, JobStatus::Failed.as_str(), error, kind.as_str(), finished_at],
        )?;
        Ok(())
    }

    fn load_job(&self, job_id: &str) -> Result<Option<Job>, Self::Error> {
        let conn = self.conn()?;
        let job = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![job_id],
                row_to_job,
            )
            .optional()?;

        let Some(mut job) = job else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT id, job_id, analysis_type, column_name, result FROM job_results \
             WHERE job_id = ?1 ORDER BY rowid",
        )?;
        job.results = stmt
            .query_map(params![job_id], row_to_result)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(job))
    }

    fn list_jobs(&self) -> Result<Vec<Job>, Self::Error> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC, rowid DESC"
        ))?;
        let jobs = stmt
            .query_map([], row_to_job)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    fn insert_alert(&self, alert: &Alert) -> Result<(), Self::Error> {
        let conn = self.conn()?;
        if !budget_exists(&conn, &alert.budget_id)? {
            return Err(StorageError::NotFound(format!("budget {}", alert.budget_id)));
        }
        conn.execute(
            "INSERT INTO alerts (id, budget_id, threshold, recipient, triggered) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                alert.id,
                alert.budget_id,
                alert.threshold,
                alert.recipient,
                i64::from(alert.triggered)
            ],
        )?;
        Ok(())
    }

    fn list_alerts(&self, budget_id: &str) -> Result<Vec<Alert>, Self::Error> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, budget_id, threshold, recipient, triggered FROM alerts \
             WHERE budget_id = ?1 ORDER BY threshold, id",
        )?;
        let alerts = stmt
            .query_map(params![budget_id], row_to_alert)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(alerts)
    }

    fn claim_alert(&self, alert_id: &str) -> Result<bool, Self::Error> {
        let conn = self.conn()?;
        let claimed = conn.execute(
            "UPDATE alerts SET triggered = 1 WHERE id = ?1 AND triggered = 0",
            params![alert_id],
        )?;
        Ok(claimed == 1)
    }

    fn delete_alert(&self, alert_id: &str) -> Result<(), Self::Error> {
        let conn = self.conn()?;
        let removed = conn.execute("DELETE FROM alerts WHERE id = ?1", params![alert_id])?;
        if removed == 0 {
            return Err(StorageError::NotFound(format!("alert {alert_id}")));
        }
        Ok(())
    }
}

impl DatasetCatalog for SqliteStorage {
    fn get_dataset(&self, dataset_id: &str) -> Result<Option<DatasetDescriptor>, SourceError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| SourceError::Unavailable("dataset registry lock poisoned".into()))?;
        let dataset = conn
            .query_row(
                "SELECT id, name, source, columns FROM datasets WHERE id = ?1",
                params![dataset_id],
                row_to_dataset,
            )
            .optional()?;
        Ok(dataset)
    }
}
