//! Orchestrator: runs the configured jobs in order for one invocation.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use jobchain_core::config::{FailurePolicy, JobchainConfig};
use jobchain_core::{Invocation, JobDefinition, JobchainError, Result};
use tokio::time::Instant;

use crate::notify::Notifier;
use crate::runner::TaskRunner;
use crate::store::StatusStore;
use crate::workflow::{JobRun, JobWorkflow};

/// Default ceiling for one whole execution.
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorFailure {
    /// Ids of the jobs that ended `Failed`, in execution order.
    JobsFailed(Vec<String>),
    /// The execution ceiling passed while `job_id` was in progress. The job
    /// itself is still registered and reported.
    TimedOut { job_id: String },
}

impl std::fmt::Display for OrchestratorFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrchestratorFailure::JobsFailed(ids) => write!(f, "failed jobs: {}", ids.join(", ")),
            OrchestratorFailure::TimedOut { job_id } => {
                write!(f, "execution timed out during {job_id}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorOutcome {
    Succeeded,
    Failed(OrchestratorFailure),
}

/// Result of one execution of the chain.
#[derive(Debug, Clone)]
pub struct OrchestratorReport {
    pub invocation: Invocation,
    pub outcome: OrchestratorOutcome,
    /// Jobs that reached a terminal state, in order.
    pub jobs: Vec<JobRun>,
    /// Jobs that were never started.
    pub not_run: Vec<String>,
    pub elapsed: Duration,
}

impl OrchestratorReport {
    pub fn is_success(&self) -> bool {
        self.outcome == OrchestratorOutcome::Succeeded
    }
}

pub struct Orchestrator {
    workflows: Vec<JobWorkflow>,
    policy: FailurePolicy,
    execution_timeout: Duration,
}

impl Orchestrator {
    /// Jobs run in the given order. Ids must be unique and non-empty.
    pub fn new(
        jobs: Vec<JobDefinition>,
        store: Arc<dyn StatusStore>,
        runner: Arc<dyn TaskRunner>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let mut seen = HashSet::new();
        for job in &jobs {
            if job.id.trim().is_empty() {
                return Err(JobchainError::Config("job id must not be empty".into()));
            }
            if !seen.insert(job.id.as_str()) {
                return Err(JobchainError::Config(format!("duplicate job id '{}'", job.id)));
            }
        }

        let workflows = jobs
            .into_iter()
            .map(|job| JobWorkflow::new(job, store.clone(), runner.clone(), notifier.clone()))
            .collect();
        Ok(Self {
            workflows,
            policy: FailurePolicy::Halt,
            execution_timeout: DEFAULT_EXECUTION_TIMEOUT,
        })
    }

    pub fn from_config(
        config: &JobchainConfig,
        store: Arc<dyn StatusStore>,
        runner: Arc<dyn TaskRunner>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        Ok(Self::new(config.jobs.clone(), store, runner, notifier)?
            .with_policy(config.orchestrator.failure_policy)
            .with_execution_timeout(Duration::from_secs(config.orchestrator.execution_timeout_secs)))
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn jobs(&self) -> impl Iterator<Item = &JobDefinition> {
        self.workflows.iter().map(|wf| wf.job())
    }

    /// One execution: each job in order, stopping at the first failure
    /// unless the policy is `Continue`. The ceiling cuts only a running task;
    /// no job starts once it has passed.
    pub async fn run(&self, invocation: Invocation) -> OrchestratorReport {
        let started = Instant::now();
        let deadline = started + self.execution_timeout;
        tracing::info!(
            "🚀 Execution started for {} ({} jobs, invoked {})",
            invocation.date(),
            self.workflows.len(),
            invocation
        );

        let mut runs = Vec::with_capacity(self.workflows.len());
        let mut failed = Vec::new();
        let mut timed_out = None;
        let mut remaining = self.workflows.iter();

        for workflow in remaining.by_ref() {
            let run = workflow.execute_until(&invocation, Some(deadline)).await;
            let halt = run.outcome.is_failure() && self.policy == FailurePolicy::Halt;
            if run.outcome.is_failure() {
                failed.push(run.job_id.clone());
            }
            runs.push(run);
            if Instant::now() >= deadline {
                timed_out = Some(workflow.job().id.clone());
                break;
            }
            if halt {
                break;
            }
        }
        let not_run: Vec<String> = remaining.map(|wf| wf.job().id.clone()).collect();

        let outcome = match timed_out {
            Some(job_id) => OrchestratorOutcome::Failed(OrchestratorFailure::TimedOut { job_id }),
            None if !failed.is_empty() => {
                OrchestratorOutcome::Failed(OrchestratorFailure::JobsFailed(failed))
            }
            None => OrchestratorOutcome::Succeeded,
        };
        match &outcome {
            OrchestratorOutcome::Succeeded => {
                tracing::info!("🏁 Execution for {} succeeded", invocation.date())
            }
            OrchestratorOutcome::Failed(failure) => {
                if not_run.is_empty() {
                    tracing::error!("💥 Execution for {} failed: {failure}", invocation.date());
                } else {
                    tracing::error!(
                        "💥 Execution for {} failed: {failure}; not run: {}",
                        invocation.date(),
                        not_run.join(", ")
                    );
                }
            }
        }

        OrchestratorReport {
            invocation,
            outcome,
            jobs: runs,
            not_run,
            elapsed: started.elapsed(),
        }
    }
}
