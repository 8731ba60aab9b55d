//! Status Store: durable (job, date) → outcome records.
//!
//! Point reads and writes only. `put` overwrites (last write wins) and there
//! is no check-then-act transaction; callers tolerate the race.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use jobchain_core::config::{StoreBackend, StoreConfig};
use jobchain_core::{InvocationRecord, JobStatus, Result};
use tokio::sync::RwLock;

use crate::persistence::SqliteStatusStore;

#[async_trait]
pub trait StatusStore: Send + Sync {
    fn name(&self) -> &str;

    /// Last known outcome for the key, `None` if never written.
    async fn get(&self, job_id: &str, date: NaiveDate) -> Result<Option<InvocationRecord>>;

    /// Write (or overwrite) the record for the key.
    async fn put(&self, job_id: &str, date: NaiveDate, status: JobStatus, message: &str)
        -> Result<()>;

    /// All records of one invocation date, ordered by job id.
    async fn list_by_date(&self, date: NaiveDate) -> Result<Vec<InvocationRecord>>;

    /// Most recent records of one job, newest date first.
    async fn history(&self, job_id: &str, limit: usize) -> Result<Vec<InvocationRecord>>;
}

/// In-process store. Not durable; meant for tests and dry runs.
#[derive(Debug, Default, Clone)]
pub struct MemoryStatusStore {
    records: Arc<RwLock<HashMap<(String, NaiveDate), InvocationRecord>>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, job_id: &str, date: NaiveDate) -> Result<Option<InvocationRecord>> {
        Ok(self
            .records
            .read()
            .await
            .get(&(job_id.to_string(), date))
            .cloned())
    }

    async fn put(
        &self,
        job_id: &str,
        date: NaiveDate,
        status: JobStatus,
        message: &str,
    ) -> Result<()> {
        let record = InvocationRecord {
            job_id: job_id.to_string(),
            invocation_date: date,
            status,
            message: message.to_string(),
        };
        self.records
            .write()
            .await
            .insert((job_id.to_string(), date), record);
        Ok(())
    }

    async fn list_by_date(&self, date: NaiveDate) -> Result<Vec<InvocationRecord>> {
        let mut records: Vec<_> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.invocation_date == date)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        Ok(records)
    }

    async fn history(&self, job_id: &str, limit: usize) -> Result<Vec<InvocationRecord>> {
        let mut records: Vec<_> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.invocation_date.cmp(&a.invocation_date));
        records.truncate(limit);
        Ok(records)
    }
}

/// Open the configured backend. `config.path` must already be expanded.
pub fn store_from_config(config: &StoreConfig) -> Result<Arc<dyn StatusStore>> {
    match config.backend {
        StoreBackend::Memory => {
            tracing::warn!("⚠️ Using the in-memory status store; outcomes are lost on exit");
            Ok(Arc::new(MemoryStatusStore::new()))
        }
        StoreBackend::Sqlite => {
            let path = Path::new(&config.path);
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }
            Ok(Arc::new(SqliteStatusStore::open(path)?))
        }
    }
}
