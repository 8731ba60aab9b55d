//! Test doubles for the three collaborators of a job workflow.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use jobchain_core::{FailureNotice, InvocationRecord, JobDefinition, JobStatus, JobchainError, Result, TaskSpec};

use crate::notify::Notifier;
use crate::runner::{TaskFailure, TaskRequest, TaskResult, TaskRunner};
use crate::store::StatusStore;

pub fn job(id: &str) -> JobDefinition {
    JobDefinition::new(id, TaskSpec::image("registry.example.com/batch:latest"))
}

pub fn date(raw: &str) -> NaiveDate {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").unwrap()
}

/// Runner with per-job scripted results. Unscripted runs succeed.
#[derive(Default)]
pub struct ScriptedRunner {
    script: Mutex<HashMap<String, VecDeque<TaskResult>>>,
    calls: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every run sleeps first, so overlapping executions interleave.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn fail(self, job_id: &str, detail: &str) -> Self {
        self.push(job_id, Err(TaskFailure::new(detail)))
    }

    pub fn push(self, job_id: &str, result: TaskResult) -> Self {
        self.script
            .lock()
            .unwrap()
            .entry(job_id.to_string())
            .or_default()
            .push_back(result);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, job_id: &str) -> usize {
        self.calls().iter().filter(|c| *c == job_id).count()
    }
}

#[async_trait]
impl TaskRunner for ScriptedRunner {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn run(&self, request: &TaskRequest) -> TaskResult {
        self.calls.lock().unwrap().push(request.job_id.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self
            .script
            .lock()
            .unwrap()
            .get_mut(&request.job_id)
            .and_then(|q| q.pop_front());
        next.unwrap_or(Ok(()))
    }
}

/// Runner that never finishes on its own.
pub struct HangingRunner;

#[async_trait]
impl TaskRunner for HangingRunner {
    fn name(&self) -> &str {
        "hanging"
    }

    async fn run(&self, _request: &TaskRequest) -> TaskResult {
        std::future::pending::<()>().await;
        Ok(())
    }
}

/// Runner that panics.
pub struct PanickingRunner;

#[async_trait]
impl TaskRunner for PanickingRunner {
    fn name(&self) -> &str {
        "panicking"
    }

    async fn run(&self, _request: &TaskRequest) -> TaskResult {
        panic!("runner blew up")
    }
}

/// Records notices together with the stored status observed at the moment
/// of notification.
pub struct RecordingNotifier {
    store: Option<(Arc<dyn StatusStore>, NaiveDate)>,
    notices: Mutex<Vec<(FailureNotice, Option<JobStatus>)>>,
    fail: bool,
    delay: Option<Duration>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self {
            store: None,
            notices: Mutex::new(Vec::new()),
            fail: false,
            delay: None,
        }
    }

    /// Each delivery takes `delay` before it is recorded.
    pub fn with_delay(self, delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..self
        }
    }

    pub fn observing(store: Arc<dyn StatusStore>, date: NaiveDate) -> Self {
        Self {
            store: Some((store, date)),
            ..Self::new()
        }
    }

    /// Every delivery errors, after recording.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub fn notices(&self) -> Vec<FailureNotice> {
        self.notices.lock().unwrap().iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn observed(&self) -> Vec<Option<JobStatus>> {
        self.notices.lock().unwrap().iter().map(|(_, s)| *s).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn name(&self) -> &str {
        "recording"
    }

    async fn notify(&self, notice: &FailureNotice) -> Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let observed = match &self.store {
            Some((store, date)) => store
                .get(&notice.job_id, *date)
                .await
                .ok()
                .flatten()
                .map(|r| r.status),
            None => None,
        };
        self.notices.lock().unwrap().push((notice.clone(), observed));
        if self.fail {
            return Err(JobchainError::Notify("channel down".into()));
        }
        Ok(())
    }
}

/// Store whose reads and/or writes fail.
#[derive(Default)]
pub struct BrokenStore {
    pub fail_get: bool,
    pub fail_put: bool,
    pub puts: Mutex<Vec<(String, JobStatus)>>,
}

#[async_trait]
impl StatusStore for BrokenStore {
    fn name(&self) -> &str {
        "broken"
    }

    async fn get(&self, _job_id: &str, _date: NaiveDate) -> Result<Option<InvocationRecord>> {
        if self.fail_get {
            return Err(JobchainError::Store("table unavailable".into()));
        }
        Ok(None)
    }

    async fn put(&self, job_id: &str, _date: NaiveDate, status: JobStatus, _message: &str) -> Result<()> {
        self.puts.lock().unwrap().push((job_id.to_string(), status));
        if self.fail_put {
            return Err(JobchainError::Store("throttled".into()));
        }
        Ok(())
    }

    async fn list_by_date(&self, _date: NaiveDate) -> Result<Vec<InvocationRecord>> {
        Ok(Vec::new())
    }

    async fn history(&self, _job_id: &str, _limit: usize) -> Result<Vec<InvocationRecord>> {
        Ok(Vec::new())
    }
}
