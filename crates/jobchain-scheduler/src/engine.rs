//! Scheduler Trigger: starts an orchestrator execution at each cron fire time.
//! Sleeps until the next fire time; executions run as their own tasks so a
//! slow one never delays the next firing.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobchain_core::{Invocation, JobchainError, Result};
use tokio::task::{JoinError, JoinSet};

use crate::cron::CronSchedule;
use crate::orchestrator::{Orchestrator, OrchestratorReport};

pub struct SchedulerTrigger {
    orchestrator: Arc<Orchestrator>,
    schedule: CronSchedule,
}

impl SchedulerTrigger {
    pub fn new(orchestrator: Arc<Orchestrator>, schedule: CronSchedule) -> Self {
        Self {
            orchestrator,
            schedule,
        }
    }

    pub fn schedule(&self) -> &CronSchedule {
        &self.schedule
    }

    /// Fire time following one that just fired. Fire times that passed while
    /// the process was busy or asleep are skipped, never replayed.
    pub fn next_fire(&self, fired: DateTime<Utc>, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        self.schedule.next_after(fired.max(now)).ok_or_else(|| {
            JobchainError::Config(format!("cron '{}' never fires", self.schedule))
        })
    }

    /// Fire until `shutdown` resolves, then wait for in-flight executions.
    /// Returns how many executions were started.
    ///
    /// Each execution gets its scheduled fire time as the invocation
    /// timestamp, so a late wake-up still lands on the intended date.
    pub async fn run<F>(&self, shutdown: F) -> Result<usize>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut in_flight: JoinSet<OrchestratorReport> = JoinSet::new();
        let mut fired = 0usize;
        let mut next = self.next_fire(Utc::now(), Utc::now())?;

        tracing::info!("⏰ Scheduler started (cron '{}' UTC)", self.schedule);
        loop {
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tracing::info!("⏰ Next execution at {next}");

            tokio::select! {
                _ = &mut shutdown => break,
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    log_finished(joined);
                }
                _ = tokio::time::sleep(wait) => {
                    let orchestrator = self.orchestrator.clone();
                    let invocation = Invocation::at(next);
                    tracing::info!("🔔 Firing execution for {invocation}");
                    in_flight.spawn(async move { orchestrator.run(invocation).await });
                    fired += 1;
                    next = self.next_fire(next, Utc::now())?;
                }
            }
        }

        if !in_flight.is_empty() {
            tracing::info!("⏳ Waiting for {} in-flight execution(s)", in_flight.len());
        }
        while let Some(joined) = in_flight.join_next().await {
            log_finished(joined);
        }
        tracing::info!("👋 Scheduler stopped after {fired} execution(s)");
        Ok(fired)
    }
}

fn log_finished(joined: std::result::Result<OrchestratorReport, JoinError>) {
    match joined {
        Ok(report) => tracing::debug!(
            "Execution for {} finished in {:?} (success: {})",
            report.invocation.date(),
            report.elapsed,
            report.is_success()
        ),
        Err(e) => tracing::error!("💥 Execution task aborted: {e}"),
    }
}
