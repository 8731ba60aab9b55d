//! # jobchain scheduler
//!
//! Runs a fixed, ordered chain of containerized jobs at most once per
//! calendar day, records each outcome durably and tells an operator when a
//! job fails.
//!
//! ## Architecture
//! ```text
//! SchedulerTrigger (cron, UTC)
//!   └── fire(timestamp) → Orchestrator
//!         ├── JobWorkflow job0001 ── StatusStore.get/put, TaskRunner, Notifier
//!         ├── JobWorkflow job0002
//!         └── ...           (halts on the first failure by default)
//!
//! JobWorkflow
//!   TransformInput → CheckStatus ─┬─ SUCCEEDED ──────────────→ Skipped
//!                                 └─ RunTask ─┬─ ok ─→ RegisterSucceeded → Succeeded
//!                                             └─ err → RegisterFailed → (notify) → Failed
//! ```
//!
//! Executions started by different firings are not mutually exclusive: two
//! overlapping executions may both see "no record" for a job and both run it.
//! The store keeps whichever write lands last.

pub mod cron;
pub mod dispatch;
pub mod engine;
pub mod notify;
pub mod orchestrator;
pub mod persistence;
pub mod runner;
pub mod store;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testkit;

pub use cron::CronSchedule;
pub use dispatch::{EmailNotifier, WebhookNotifier, notifier_from_config};
pub use engine::SchedulerTrigger;
pub use notify::{LogNotifier, Notifier};
pub use orchestrator::{Orchestrator, OrchestratorFailure, OrchestratorOutcome, OrchestratorReport};
pub use persistence::SqliteStatusStore;
pub use runner::{ContainerRunner, ProcessRunner, TaskFailure, TaskRequest, TaskRunner, runner_from_config};
pub use store::{MemoryStatusStore, StatusStore, store_from_config};
pub use workflow::{FailureReason, JobOutcome, JobRun, JobState, JobWorkflow};
