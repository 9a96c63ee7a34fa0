//! dpledger: Differential-privacy query engine
//!
//! Administrative command-line entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dpledger::adapters::noise::ChaChaNoise;
use dpledger::adapters::notify::LogNotifier;
use dpledger::adapters::sanitize::SanitizingMakeWriter;
use dpledger::adapters::sqlite::SqliteStorage;
use dpledger::adapters::tabular::SourceRouter;
use dpledger::application::{AdminService, BudgetLedger, JobService};
use dpledger::config::EngineConfig;
use dpledger::domain::DatasetDescriptor;
use dpledger::{JobRequest, JobStatus, Mechanism, Metric};

#[derive(Parser)]
#[command(name = "dpledger")]
#[command(
    about = "Differential-privacy query engine with privacy budget accounting",
    long_about = None
)]
struct Cli {
    /// TOML config file (defaults to $DPLEDGER_CONFIG)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a dataset from a JSON descriptor file
    RegisterDataset {
        /// Path to the descriptor JSON
        file: PathBuf,
        /// Initial epsilon allocation (defaults to config)
        #[arg(long)]
        epsilon: Option<f64>,
        /// Initial delta allocation (defaults to config)
        #[arg(long)]
        delta: Option<f64>,
    },
    /// List registered datasets
    Datasets,
    /// Delete a dataset with its budget and alerts
    DeleteDataset { dataset_id: String },
    /// Run a DP analysis job
    Submit {
        #[arg(long)]
        dataset: String,
        /// Budget to charge
        #[arg(long)]
        budget: Option<String>,
        /// Comma-separated metrics (count,sum,mean,median,min,max,variance,std,histogram)
        #[arg(long, value_delimiter = ',', required = true)]
        metrics: Vec<Metric>,
        /// Comma-separated columns (defaults to all non-PII columns)
        #[arg(long, value_delimiter = ',')]
        columns: Option<Vec<String>>,
        #[arg(long, default_value = "laplace")]
        mechanism: Mechanism,
        #[arg(long)]
        epsilon: f64,
        #[arg(long)]
        delta: Option<f64>,
    },
    /// List jobs, newest first
    Jobs,
    /// Show a job with its results
    Job { job_id: String },
    /// Show a budget
    Budget { budget_id: String },
    /// List all budgets
    Budgets,
    /// Create a budget for a dataset that has none
    CreateBudget {
        dataset_id: String,
        /// Epsilon allocation (defaults to config)
        #[arg(long)]
        epsilon: Option<f64>,
        /// Delta allocation (defaults to config)
        #[arg(long)]
        delta: Option<f64>,
    },
    /// Totals across all budgets
    Overview,
    /// Zero a budget's consumption and re-arm its alerts
    ResetBudget { budget_id: String },
    /// Add to a budget's allocation
    Allocate {
        budget_id: String,
        #[arg(long, default_value_t = 0.0)]
        epsilon: f64,
        #[arg(long, default_value_t = 0.0)]
        delta: f64,
    },
    /// Delete a budget that no job references
    DeleteBudget { budget_id: String },
    /// Show or update the per-job epsilon ceiling
    Policy {
        #[arg(long)]
        set: Option<f64>,
    },
    /// Manage budget alerts
    Alerts {
        #[command(subcommand)]
        command: AlertCommands,
    },
}

#[derive(Subcommand)]
enum AlertCommands {
    /// Alerts configured on a budget
    List { budget_id: String },
    /// Notify `recipient` once consumption reaches `threshold` percent
    Add {
        budget_id: String,
        #[arg(long)]
        threshold: f64,
        #[arg(long)]
        recipient: String,
    },
    Delete { alert_id: String },
}

type Jobs = JobService<SqliteStorage, SqliteStorage, SourceRouter, ChaChaNoise, LogNotifier>;

struct Engine {
    storage: Arc<SqliteStorage>,
    admin: AdminService<SqliteStorage>,
    jobs: Jobs,
}

impl Engine {
    fn open(config: &EngineConfig) -> Result<Self> {
        let storage = Arc::new(
            SqliteStorage::new(&config.database_path)
                .with_context(|| format!("opening {}", config.database_path.display()))?,
        );
        let ledger = Arc::new(BudgetLedger::new(Arc::clone(&storage)));
        let admin = AdminService::new(config, Arc::clone(&storage), Arc::clone(&ledger));
        let jobs = JobService::new(
            config,
            Arc::clone(&storage),
            ledger,
            Arc::clone(&storage),
            Arc::new(SourceRouter::new()),
            Arc::new(ChaChaNoise::new()),
            Arc::new(LogNotifier),
        );
        Ok(Self { storage, admin, jobs })
    }
}

fn init_logging() -> Result<tracing_appender::non_blocking::WorkerGuard> {
    // stdout carries command output, so logs default to stderr.
    let log_mode = std::env::var("DPLEDGER_LOG_MODE").unwrap_or_else(|_| "stderr".to_string());

    let (writer, guard) = if log_mode == "file" {
        let log_file =
            std::env::var("DPLEDGER_LOG_FILE").unwrap_or_else(|_| "dpledger.log".to_string());

        if let Some(parent) = std::path::Path::new(&log_file).parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .with_context(|| format!("opening log file {log_file}"))?;
        tracing_appender::non_blocking(file)
    } else if log_mode == "stdout" {
        tracing_appender::non_blocking(std::io::stdout())
    } else {
        tracing_appender::non_blocking(std::io::stderr())
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(SanitizingMakeWriter::new(writer)))
        .init();
    Ok(guard)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging()?;

    let config = EngineConfig::load(cli.config.as_deref())?;
    let engine = Engine::open(&config)?;

    match cli.command {
        Commands::RegisterDataset { file, epsilon, delta } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let dataset: DatasetDescriptor =
                serde_json::from_str(&raw).context("parsing dataset descriptor")?;
            let status = engine.admin.register_dataset_with_budget(
                &dataset,
                epsilon.unwrap_or(config.default_epsilon_allocation),
                delta.unwrap_or(config.default_delta_allocation),
            )?;
            print_json(&status)?;
        }
        Commands::Datasets => print_json(&engine.storage.list_datasets()?)?,
        Commands::DeleteDataset { dataset_id } => engine.admin.delete_dataset(&dataset_id)?,
        Commands::Submit {
            dataset,
            budget,
            metrics,
            columns,
            mechanism,
            epsilon,
            delta,
        } => {
            let mut request = JobRequest::new(dataset, metrics, epsilon).with_mechanism(mechanism);
            request.budget_id = budget;
            request.columns = columns;
            request.delta = delta;

            let job = engine.jobs.submit(request)?;
            print_json(&job)?;
            if job.status == JobStatus::Failed {
                anyhow::bail!("job {} failed: {}", job.id, job.error.unwrap_or_default());
            }
        }
        Commands::Jobs => print_json(&engine.jobs.list_jobs()?)?,
        Commands::Job { job_id } => print_json(&engine.jobs.get_job(&job_id)?)?,
        Commands::Budget { budget_id } => {
            print_json(&engine.admin.get_budget_status(&budget_id)?)?;
        }
        Commands::Budgets => print_json(&engine.admin.list_budgets()?)?,
        Commands::CreateBudget { dataset_id, epsilon, delta } => {
            let status = engine.admin.create_budget(
                &dataset_id,
                epsilon.unwrap_or(config.default_epsilon_allocation),
                delta.unwrap_or(config.default_delta_allocation),
            )?;
            print_json(&status)?;
        }
        Commands::Overview => print_json(&engine.admin.budget_overview()?)?,
        Commands::ResetBudget { budget_id } => {
            print_json(&engine.admin.reset_budget(&budget_id)?)?;
        }
        Commands::Allocate { budget_id, epsilon, delta } => {
            print_json(&engine.admin.allocate_budget(&budget_id, epsilon, delta)?)?;
        }
        Commands::DeleteBudget { budget_id } => engine.admin.delete_budget(&budget_id)?,
        Commands::Policy { set } => {
            let policy = match set {
                Some(max) => engine.admin.update_policy(max)?,
                None => engine.admin.get_policy()?,
            };
            print_json(&policy)?;
        }
        Commands::Alerts { command } => match command {
            AlertCommands::List { budget_id } => {
                print_json(&engine.admin.list_alerts(&budget_id)?)?;
            }
            AlertCommands::Add {
                budget_id,
                threshold,
                recipient,
            } => print_json(&engine.admin.create_alert(&budget_id, threshold, &recipient)?)?,
            AlertCommands::Delete { alert_id } => engine.admin.delete_alert(&alert_id)?,
        },
    }

    Ok(())
}
