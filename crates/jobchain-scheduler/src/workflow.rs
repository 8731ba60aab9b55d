//! Job Workflow: the per-job state machine.
//!
//! ```text
//! TransformInput → CheckStatus ─┬─ record SUCCEEDED ───────────→ Skipped
//!                               ├─ store error ────────────────→ Failed
//!                               └─ RunTask ─┬─ ok ──→ RegisterSucceeded → Succeeded
//!                                           └─ err ─→ RegisterFailed ──→ Failed
//! ```
//!
//! `RegisterFailed` writes the FAILED record before it notifies, and both
//! happen before the terminal `Failed` is reported. A deadline only ever
//! cuts the `RunTask` wait, so once a task result is known the record and
//! the notification always go out.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use futures::FutureExt;
use jobchain_core::{FailureNotice, Invocation, JobDefinition, JobStatus};
use tokio::time::Instant;

use crate::notify::Notifier;
use crate::runner::{TaskFailure, TaskRequest, TaskResult, TaskRunner};
use crate::store::StatusStore;

/// Failure detail of a task abandoned at the execution deadline.
pub const DEADLINE_REACHED: &str = "execution deadline reached";

/// Extra time a runner gets past the job timeout to clean up after itself
/// before the workflow stops waiting.
pub const KILL_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The Status Store could not be read or written. Not notified.
    Store(String),
    /// The task failed; recorded as FAILED and notified.
    Task(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Store(e) => write!(f, "status store: {e}"),
            FailureReason::Task(detail) => write!(f, "task: {detail}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    TransformInput,
    CheckStatus { date: NaiveDate },
    RunTask { date: NaiveDate },
    RegisterSucceeded { date: NaiveDate },
    RegisterFailed { date: NaiveDate, detail: String },
    Skipped,
    Succeeded,
    Failed(FailureReason),
}

impl JobState {
    pub fn name(&self) -> &'static str {
        match self {
            JobState::TransformInput => "TransformInput",
            JobState::CheckStatus { .. } => "CheckStatus",
            JobState::RunTask { .. } => "RunTask",
            JobState::RegisterSucceeded { .. } => "RegisterSucceeded",
            JobState::RegisterFailed { .. } => "RegisterFailed",
            JobState::Skipped => "Skipped",
            JobState::Succeeded => "Succeeded",
            JobState::Failed(_) => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Skipped | JobState::Succeeded | JobState::Failed(_))
    }
}

/// Terminal state of one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Skipped,
    Succeeded,
    Failed(FailureReason),
}

impl JobOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, JobOutcome::Failed(_))
    }
}

impl std::fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobOutcome::Skipped => f.write_str("SKIPPED"),
            JobOutcome::Succeeded => f.write_str("SUCCEEDED"),
            JobOutcome::Failed(reason) => write!(f, "FAILED ({reason})"),
        }
    }
}

/// Report of one job execution.
#[derive(Debug, Clone)]
pub struct JobRun {
    pub job_id: String,
    pub invocation_date: NaiveDate,
    pub outcome: JobOutcome,
    /// Visited states, first to last.
    pub trace: Vec<&'static str>,
    pub elapsed: Duration,
}

/// Composes Status Store, Task Runner and Notifier for one job.
#[derive(Clone)]
pub struct JobWorkflow {
    job: JobDefinition,
    store: Arc<dyn StatusStore>,
    runner: Arc<dyn TaskRunner>,
    notifier: Arc<dyn Notifier>,
}

impl JobWorkflow {
    pub fn new(
        job: JobDefinition,
        store: Arc<dyn StatusStore>,
        runner: Arc<dyn TaskRunner>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            job,
            store,
            runner,
            notifier,
        }
    }

    pub fn job(&self) -> &JobDefinition {
        &self.job
    }

    /// Drive the state machine from `TransformInput` to a terminal state.
    pub async fn execute(&self, invocation: &Invocation) -> JobRun {
        self.execute_until(invocation, None).await
    }

    /// Like [`execute`](Self::execute), but the task is abandoned at
    /// `deadline` and registered as failed.
    pub async fn execute_until(&self, invocation: &Invocation, deadline: Option<Instant>) -> JobRun {
        let started = Instant::now();
        let mut state = JobState::TransformInput;
        let mut trace = vec![state.name()];

        let outcome = loop {
            state = match state {
                JobState::Skipped => break JobOutcome::Skipped,
                JobState::Succeeded => break JobOutcome::Succeeded,
                JobState::Failed(reason) => break JobOutcome::Failed(reason),
                current => {
                    let from = current.name();
                    let next = self.advance(current, invocation, deadline).await;
                    tracing::debug!("[{}] {} → {}", self.job.id, from, next.name());
                    trace.push(next.name());
                    next
                }
            };
        };
        match &outcome {
            JobOutcome::Skipped => {
                tracing::info!("⏭️ [{}] already succeeded for {}, skipped", self.job.id, invocation.date())
            }
            JobOutcome::Succeeded => tracing::info!("✅ [{}] succeeded", self.job.id),
            JobOutcome::Failed(reason) => tracing::warn!("❌ [{}] failed: {reason}", self.job.id),
        }

        JobRun {
            job_id: self.job.id.clone(),
            invocation_date: invocation.date(),
            outcome,
            trace,
            elapsed: started.elapsed(),
        }
    }

    /// Single transition. Terminal states map to themselves.
    pub async fn step(&self, state: JobState, invocation: &Invocation) -> JobState {
        self.advance(state, invocation, None).await
    }

    async fn advance(&self, state: JobState, invocation: &Invocation, deadline: Option<Instant>) -> JobState {
        match state {
            JobState::TransformInput => JobState::CheckStatus {
                date: invocation.date(),
            },

            JobState::CheckStatus { date } => match self.store.get(&self.job.id, date).await {
                Err(e) => JobState::Failed(FailureReason::Store(e.to_string())),
                Ok(Some(record)) if record.status == JobStatus::Succeeded => JobState::Skipped,
                Ok(_) => JobState::RunTask { date },
            },

            JobState::RunTask { date } => match self.run_task(date, deadline).await {
                Ok(()) => JobState::RegisterSucceeded { date },
                Err(failure) => JobState::RegisterFailed {
                    date,
                    detail: failure.detail,
                },
            },

            JobState::RegisterSucceeded { date } => {
                match self.store.put(&self.job.id, date, JobStatus::Succeeded, "").await {
                    Ok(()) => JobState::Succeeded,
                    Err(e) => JobState::Failed(FailureReason::Store(e.to_string())),
                }
            }

            JobState::RegisterFailed { date, detail } => {
                if let Err(e) = self
                    .store
                    .put(&self.job.id, date, JobStatus::Failed, &detail)
                    .await
                {
                    return JobState::Failed(FailureReason::Store(e.to_string()));
                }
                let notice = FailureNotice::failed(&self.job.id);
                if let Err(e) = self.notifier.notify(&notice).await {
                    tracing::warn!(
                        "⚠️ [{}] {} notification failed: {e}",
                        self.job.id,
                        self.notifier.name()
                    );
                }
                JobState::Failed(FailureReason::Task(detail))
            }

            terminal => terminal,
        }
    }

    /// One attempt under a hard ceiling: the job timeout plus grace, or
    /// `deadline` if that comes first. Whatever the runner does, including
    /// panicking or ignoring its timeout, comes back as a `TaskResult`.
    async fn run_task(&self, date: NaiveDate, deadline: Option<Instant>) -> TaskResult {
        let request = TaskRequest::new(&self.job, date);
        let attempt = AssertUnwindSafe(self.runner.run(&request)).catch_unwind();
        let own_limit = Instant::now() + request.timeout + KILL_GRACE;
        let limit = deadline.map_or(own_limit, |d| d.min(own_limit));

        match tokio::time::timeout_at(limit, attempt).await {
            Ok(Ok(result)) => result,
            Ok(Err(payload)) => Err(TaskFailure::new(format!(
                "runner panicked: {}",
                panic_message(payload.as_ref())
            ))),
            Err(_) if limit < own_limit => Err(TaskFailure::new(DEADLINE_REACHED)),
            Err(_) => Err(TaskFailure::timed_out(request.timeout)),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::LogNotifier;
    use crate::store::MemoryStatusStore;
    use crate::testkit::*;

    fn invocation() -> Invocation {
        Invocation::parse("2024-05-06T12:00:00Z").unwrap()
    }

    fn workflow(
        store: Arc<dyn StatusStore>,
        runner: Arc<dyn TaskRunner>,
        notifier: Arc<dyn Notifier>,
    ) -> JobWorkflow {
        JobWorkflow::new(job("job0001"), store, runner, notifier)
    }

    #[tokio::test]
    async fn test_happy_path() {
        let store = Arc::new(MemoryStatusStore::new());
        let runner = Arc::new(ScriptedRunner::new());
        let notifier = Arc::new(RecordingNotifier::new());

        let run = workflow(store.clone(), runner.clone(), notifier.clone())
            .execute(&invocation())
            .await;

        assert_eq!(run.outcome, JobOutcome::Succeeded);
        assert_eq!(
            run.trace,
            ["TransformInput", "CheckStatus", "RunTask", "RegisterSucceeded", "Succeeded"]
        );
        let rec = store.get("job0001", date("2024-05-06")).await.unwrap().unwrap();
        assert_eq!(rec.status, JobStatus::Succeeded);
        assert_eq!(rec.message, "");
        assert!(notifier.notices().is_empty());
        assert_eq!(runner.calls_for("job0001"), 1);
    }

    #[tokio::test]
    async fn test_rerun_after_success_is_skipped() {
        let store = Arc::new(MemoryStatusStore::new());
        store
            .put("job0001", date("2024-05-06"), JobStatus::Succeeded, "")
            .await
            .unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let notifier = Arc::new(RecordingNotifier::new());

        let run = workflow(store.clone(), runner.clone(), notifier.clone())
            .execute(&invocation())
            .await;

        assert_eq!(run.outcome, JobOutcome::Skipped);
        assert_eq!(run.trace, ["TransformInput", "CheckStatus", "Skipped"]);
        assert!(runner.calls().is_empty());
        assert!(notifier.notices().is_empty());
    }

    #[tokio::test]
    async fn test_idempotent_within_a_day() {
        let store = Arc::new(MemoryStatusStore::new());
        let runner = Arc::new(ScriptedRunner::new());
        let wf = workflow(store.clone(), runner.clone(), Arc::new(LogNotifier::new()));

        let morning = Invocation::parse("2024-05-06T00:05:00Z").unwrap();
        let evening = Invocation::parse("2024-05-06T23:55:00Z").unwrap();
        assert_eq!(wf.execute(&morning).await.outcome, JobOutcome::Succeeded);
        assert_eq!(wf.execute(&evening).await.outcome, JobOutcome::Skipped);
        assert_eq!(wf.execute(&evening).await.outcome, JobOutcome::Skipped);
        assert_eq!(runner.calls_for("job0001"), 1);

        // A new day runs again.
        let next_day = Invocation::parse("2024-05-07T12:00:00Z").unwrap();
        assert_eq!(wf.execute(&next_day).await.outcome, JobOutcome::Succeeded);
        assert_eq!(runner.calls_for("job0001"), 2);
    }

    #[tokio::test]
    async fn test_previous_failure_runs_again() {
        let store = Arc::new(MemoryStatusStore::new());
        store
            .put("job0001", date("2024-05-06"), JobStatus::Failed, "exit code 1")
            .await
            .unwrap();
        let runner = Arc::new(ScriptedRunner::new());

        let run = workflow(store.clone(), runner.clone(), Arc::new(LogNotifier::new()))
            .execute(&invocation())
            .await;

        assert_eq!(run.outcome, JobOutcome::Succeeded);
        assert_eq!(runner.calls_for("job0001"), 1);
        let rec = store.get("job0001", date("2024-05-06")).await.unwrap().unwrap();
        assert_eq!(rec.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_task_failure_is_recorded_and_notified() {
        let store = Arc::new(MemoryStatusStore::new());
        let runner = Arc::new(ScriptedRunner::new().fail("job0001", "exit code 137"));
        let notifier = Arc::new(RecordingNotifier::new());

        let run = workflow(store.clone(), runner, notifier.clone())
            .execute(&invocation())
            .await;

        assert_eq!(run.outcome, JobOutcome::Failed(FailureReason::Task("exit code 137".into())));
        assert_eq!(
            run.trace,
            ["TransformInput", "CheckStatus", "RunTask", "RegisterFailed", "Failed"]
        );
        let rec = store.get("job0001", date("2024-05-06")).await.unwrap().unwrap();
        assert_eq!(rec.status, JobStatus::Failed);
        assert_eq!(rec.message, "exit code 137");
        assert_eq!(notifier.notices(), vec![FailureNotice::failed("job0001")]);
    }

    #[tokio::test]
    async fn test_record_written_before_notification() {
        let store = Arc::new(MemoryStatusStore::new());
        let runner = Arc::new(ScriptedRunner::new().fail("job0001", "boom"));
        let notifier = Arc::new(RecordingNotifier::observing(store.clone(), date("2024-05-06")));

        workflow(store, runner, notifier.clone())
            .execute(&invocation())
            .await;

        assert_eq!(notifier.observed(), vec![Some(JobStatus::Failed)]);
    }

    #[tokio::test]
    async fn test_notifier_error_does_not_change_outcome() {
        let store = Arc::new(MemoryStatusStore::new());
        let runner = Arc::new(ScriptedRunner::new().fail("job0001", "exit code 2"));
        let notifier = Arc::new(RecordingNotifier::failing());

        let run = workflow(store.clone(), runner, notifier.clone())
            .execute(&invocation())
            .await;

        assert_eq!(run.outcome, JobOutcome::Failed(FailureReason::Task("exit code 2".into())));
        assert_eq!(notifier.notices().len(), 1);
        let rec = store.get("job0001", date("2024-05-06")).await.unwrap().unwrap();
        assert_eq!(rec.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_store_read_failure_is_fatal() {
        let store = Arc::new(BrokenStore {
            fail_get: true,
            ..BrokenStore::default()
        });
        let runner = Arc::new(ScriptedRunner::new());
        let notifier = Arc::new(RecordingNotifier::new());

        let run = workflow(store.clone(), runner.clone(), notifier.clone())
            .execute(&invocation())
            .await;

        assert!(matches!(run.outcome, JobOutcome::Failed(FailureReason::Store(_))));
        assert_eq!(run.trace, ["TransformInput", "CheckStatus", "Failed"]);
        assert!(runner.calls().is_empty());
        assert!(notifier.notices().is_empty());
        assert!(store.puts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_store_write_failure_after_success() {
        let store = Arc::new(BrokenStore {
            fail_put: true,
            ..BrokenStore::default()
        });
        let notifier = Arc::new(RecordingNotifier::new());

        let run = workflow(store, Arc::new(ScriptedRunner::new()), notifier.clone())
            .execute(&invocation())
            .await;

        assert!(matches!(run.outcome, JobOutcome::Failed(FailureReason::Store(_))));
        assert!(notifier.notices().is_empty());
    }

    #[tokio::test]
    async fn test_store_write_failure_after_task_failure_skips_notify() {
        let store = Arc::new(BrokenStore {
            fail_put: true,
            ..BrokenStore::default()
        });
        let runner = Arc::new(ScriptedRunner::new().fail("job0001", "exit code 1"));
        let notifier = Arc::new(RecordingNotifier::new());

        let run = workflow(store.clone(), runner, notifier.clone())
            .execute(&invocation())
            .await;

        assert!(matches!(run.outcome, JobOutcome::Failed(FailureReason::Store(_))));
        assert_eq!(
            *store.puts.lock().unwrap(),
            vec![("job0001".to_string(), JobStatus::Failed)]
        );
        assert!(notifier.notices().is_empty());
    }

    #[tokio::test]
    async fn test_runner_panic_is_caught() {
        let store = Arc::new(MemoryStatusStore::new());
        let notifier = Arc::new(RecordingNotifier::new());

        let run = workflow(store.clone(), Arc::new(PanickingRunner), notifier.clone())
            .execute(&invocation())
            .await;

        assert_eq!(
            run.outcome,
            JobOutcome::Failed(FailureReason::Task("runner panicked: runner blew up".into()))
        );
        let rec = store.get("job0001", date("2024-05-06")).await.unwrap().unwrap();
        assert_eq!(rec.message, "runner panicked: runner blew up");
        assert_eq!(notifier.notices().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_runner_hits_ceiling() {
        let store = Arc::new(MemoryStatusStore::new());
        let run = workflow(store.clone(), Arc::new(HangingRunner), Arc::new(LogNotifier::new()))
            .execute(&invocation())
            .await;

        assert_eq!(
            run.outcome,
            JobOutcome::Failed(FailureReason::Task("timed out after 300s".into()))
        );
        let rec = store.get("job0001", date("2024-05-06")).await.unwrap().unwrap();
        assert_eq!(rec.status, JobStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cuts_task_but_still_registers() {
        let store = Arc::new(MemoryStatusStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let deadline = Instant::now() + Duration::from_secs(60);

        let run = workflow(store.clone(), Arc::new(HangingRunner), notifier.clone())
            .execute_until(&invocation(), Some(deadline))
            .await;

        assert_eq!(
            run.outcome,
            JobOutcome::Failed(FailureReason::Task(DEADLINE_REACHED.into()))
        );
        assert!(run.elapsed >= Duration::from_secs(60));
        let rec = store.get("job0001", date("2024-05-06")).await.unwrap().unwrap();
        assert_eq!(rec.message, DEADLINE_REACHED);
        assert_eq!(notifier.notices(), vec![FailureNotice::failed("job0001")]);
    }

    #[tokio::test]
    async fn test_terminal_states_are_fixed_points() {
        let wf = workflow(
            Arc::new(MemoryStatusStore::new()),
            Arc::new(ScriptedRunner::new()),
            Arc::new(LogNotifier::new()),
        );
        for state in [JobState::Skipped, JobState::Succeeded] {
            assert!(state.is_terminal());
            assert_eq!(wf.step(state.clone(), &invocation()).await, state);
        }
        assert!(!JobState::RunTask { date: date("2024-05-06") }.is_terminal());
        assert_eq!(
            wf.step(JobState::TransformInput, &invocation()).await,
            JobState::CheckStatus { date: date("2024-05-06") }
        );
    }
}
