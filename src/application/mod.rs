//! Application layer: Use cases and services.
//!
//! This module orchestrates domain logic with ports to implement
//! the core use cases of the engine.

mod admin;
mod alerts;
mod dispatcher;
mod fetch;
mod guardrail;
mod jobs;
mod ledger;

pub use admin::{budget_id_for, AdminService};
pub use alerts::{new_alert, validate_alert, AlertEvaluator};
pub use dispatcher::MechanismDispatcher;
pub use fetch::{fetch_with_timeout, FetchGate};
pub use guardrail::PolicyGuardrail;
pub use jobs::JobService;
pub use ledger::BudgetLedger;
