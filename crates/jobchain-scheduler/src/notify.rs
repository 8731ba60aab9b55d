//! Notifier: tells the operator channel that a job failed.
//! Fire-and-forget from the workflow's point of view: a delivery error is
//! logged by the caller and never changes a job's outcome.

use async_trait::async_trait;
use jobchain_core::{FailureNotice, Result};

#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, notice: &FailureNotice) -> Result<()>;
}

/// Writes notices to the log only. Default when no channel is configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl LogNotifier {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, notice: &FailureNotice) -> Result<()> {
        tracing::error!("🚨 [{}] {}", notice.job_id, notice.message);
        Ok(())
    }
}
