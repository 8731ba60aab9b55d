//! Data model: job definitions, invocations and the per-day status records.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{JobchainError, Result};

/// Container task specification for one job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSpec {
    /// Image reference, e.g. `registry.example.com/batch:latest`.
    pub image: String,
    /// Optional argv override. Required by the process runner.
    #[serde(default)]
    pub command: Vec<String>,
    /// CPU units (1024 = one vCPU).
    #[serde(default = "default_cpu")]
    pub cpu: u32,
    #[serde(default = "default_memory_mib")]
    pub memory_mib: u32,
    /// Literal environment values.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Task variable → host environment variable holding the secret.
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
}

fn default_cpu() -> u32 { 256 }
fn default_memory_mib() -> u32 { 512 }
fn default_timeout_secs() -> u64 { 300 }

impl TaskSpec {
    /// Spec with default limits and no bindings.
    pub fn image(image: &str) -> Self {
        Self {
            image: image.to_string(),
            command: Vec::new(),
            cpu: default_cpu(),
            memory_mib: default_memory_mib(),
            environment: BTreeMap::new(),
            secrets: BTreeMap::new(),
        }
    }
}

/// Static configuration of a job. Immutable once the orchestrator is built.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobDefinition {
    /// Unique within one orchestrator.
    pub id: String,
    pub task: TaskSpec,
    /// Ceiling for a single run of the task.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl JobDefinition {
    pub fn new(id: &str, task: TaskSpec) -> Self {
        Self {
            id: id.to_string(),
            task,
            timeout_secs: default_timeout_secs(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs();
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Outcome stored for a (job, date) pair.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobchainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "SUCCEEDED" => Ok(JobStatus::Succeeded),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(JobchainError::Store(format!("unknown status '{other}'"))),
        }
    }
}

/// One Status Store row. At most one per (job_id, invocation_date).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InvocationRecord {
    pub job_id: String,
    /// Serialized as `YYYY-MM-DD`.
    pub invocation_date: NaiveDate,
    pub status: JobStatus,
    #[serde(default)]
    pub message: String,
}

/// The single piece of data a trigger firing carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Invocation {
    timestamp: DateTime<FixedOffset>,
}

impl Invocation {
    /// Invocation stamped with the current UTC time.
    pub fn now() -> Self {
        Self::at(Utc::now())
    }

    pub fn at(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp: timestamp.fixed_offset(),
        }
    }

    /// Parse an ISO-8601 timestamp. RFC 3339 with an offset is preferred;
    /// a timestamp without offset is read as UTC, and a bare `YYYY-MM-DD`
    /// as midnight UTC of that day.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Ok(Self { timestamp: ts });
        }
        let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .or_else(|_| {
                NaiveDate::parse_from_str(raw, "%Y-%m-%d").map(|d| d.and_time(NaiveTime::MIN))
            })
            .map_err(|_| JobchainError::InvalidTimestamp(raw.to_string()))?;
        Ok(Self {
            timestamp: naive.and_utc().fixed_offset(),
        })
    }

    pub fn timestamp(&self) -> DateTime<FixedOffset> {
        self.timestamp
    }

    /// Calendar date as written in the timestamp, i.e. the text before the
    /// `T` separator. The offset is not normalised away.
    pub fn date(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.timestamp.to_rfc3339())
    }
}

/// Message delivered to the operator channel when a job fails.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FailureNotice {
    pub job_id: String,
    pub message: String,
}

impl FailureNotice {
    pub fn failed(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            message: JobStatus::Failed.as_str().to_string(),
        }
    }
}
