//! jobchain configuration system.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{JobchainError, Result};
use crate::types::JobDefinition;

/// Variables every task receives from the engine. Jobs cannot set them.
pub const RESERVED_ENV: [&str; 3] = ["JOB_ID", "JOB_TYPE", "INVOKE_DATE"];

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobchainConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    /// Jobs in execution order.
    #[serde(default)]
    pub jobs: Vec<JobDefinition>,
}

impl JobchainConfig {
    /// Load config from the default path (~/.jobchain/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| JobchainError::Config(format!("Failed to read config: {e}")))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| JobchainError::Config(format!("Failed to parse config: {e}")))
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| JobchainError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the jobchain home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".jobchain")
    }

    /// Structural checks. The cron expression is checked by the scheduler
    /// crate, which owns the parser.
    pub fn validate(&self) -> Result<()> {
        if self.jobs.is_empty() {
            return Err(JobchainError::Config("no [[jobs]] configured".into()));
        }
        let mut seen = HashSet::new();
        for job in &self.jobs {
            if job.id.trim().is_empty() {
                return Err(JobchainError::Config("job id cannot be empty".into()));
            }
            if !seen.insert(job.id.as_str()) {
                return Err(JobchainError::Config(format!("duplicate job id '{}'", job.id)));
            }
            if job.timeout_secs == 0 {
                return Err(JobchainError::Config(format!(
                    "job '{}': timeout_secs must be > 0",
                    job.id
                )));
            }
            let mut names = job.task.environment.keys().chain(job.task.secrets.keys());
            if let Some(name) = names.find(|n| RESERVED_ENV.contains(&n.as_str())) {
                return Err(JobchainError::Config(format!(
                    "job '{}': {name} is set by the engine and cannot be overridden",
                    job.id
                )));
            }
            if self.runner.kind == RunnerKind::Process && job.task.command.is_empty() {
                return Err(JobchainError::Config(format!(
                    "job '{}': the process runner needs a command",
                    job.id
                )));
            }
        }
        if self.orchestrator.execution_timeout_secs == 0 {
            return Err(JobchainError::Config(
                "orchestrator.execution_timeout_secs must be > 0".into(),
            ));
        }
        match self.notify.kind {
            NotifyKind::Email if self.notify.email.is_none() => Err(JobchainError::Config(
                "notify.kind = \"email\" requires a [notify.email] section".into(),
            )),
            NotifyKind::Webhook if self.notify.webhook.is_none() => Err(JobchainError::Config(
                "notify.kind = \"webhook\" requires a [notify.webhook] section".into(),
            )),
            _ => Ok(()),
        }
    }
}

/// Scheduler Trigger configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// 5-field cron expression, evaluated in UTC.
    #[serde(default = "default_cron")]
    pub cron: String,
}

fn bool_true() -> bool { true }
fn default_cron() -> String { "0 12 * * MON-FRI".into() }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cron: default_cron(),
        }
    }
}

/// What the orchestrator does after a job fails.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Stop at the first failed job; later jobs do not run.
    #[default]
    Halt,
    /// Run every job; the execution still fails if any job failed.
    Continue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Ceiling for one whole execution.
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout_secs: u64,
}

fn default_execution_timeout() -> u64 { 600 }

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::Halt,
            execution_timeout_secs: default_execution_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// SQLite file path; `~` is expanded by the binary.
    #[serde(default = "default_store_path")]
    pub path: String,
}

fn default_store_path() -> String { "~/.jobchain/status.db".into() }

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunnerKind {
    #[default]
    Container,
    Process,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default)]
    pub kind: RunnerKind,
    /// Container CLI (docker, podman, ...).
    #[serde(default = "default_runner_binary")]
    pub binary: String,
}

fn default_runner_binary() -> String { "docker".into() }

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            kind: RunnerKind::Container,
            binary: default_runner_binary(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotifyKind {
    #[default]
    Log,
    Email,
    Webhook,
}

/// Operator channel for failure notices.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub kind: NotifyKind,
    #[serde(default)]
    pub email: Option<EmailNotifyConfig>,
    #[serde(default)]
    pub webhook: Option<WebhookNotifyConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailNotifyConfig {
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub from: String,
    /// The single subscriber address.
    pub to: String,
}

fn default_smtp_port() -> u16 { 587 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookNotifyConfig {
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}
