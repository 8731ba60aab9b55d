//! SQLite-backed Status Store: survives restarts, one row per (job, date).

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use jobchain_core::{InvocationRecord, JobStatus, JobchainError, Result};
use rusqlite::{Connection, params};

use crate::store::StatusStore;

/// SQLite persistence for invocation records.
pub struct SqliteStatusStore {
    conn: Mutex<Connection>,
}

impl SqliteStatusStore {
    /// Open or create the status database.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| store_err("DB open", e))?;
        Self::with_connection(conn)
    }

    /// Private in-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| store_err("DB open", e))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            -- Last known outcome per job and invocation date
            CREATE TABLE IF NOT EXISTS invocation_records (
                job_id TEXT NOT NULL,
                invocation_date TEXT NOT NULL,   -- YYYY-MM-DD
                status TEXT NOT NULL,            -- 'SUCCEEDED' | 'FAILED'
                message TEXT NOT NULL DEFAULT '',
                updated_at TEXT NOT NULL,
                PRIMARY KEY (job_id, invocation_date)
            );
            CREATE INDEX IF NOT EXISTS idx_invocation_records_date
                ON invocation_records (invocation_date);
            ",
        )
        .map_err(|e| store_err("Migration", e))?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| JobchainError::Store("connection mutex poisoned".into()))
    }

    fn query(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<InvocationRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql).map_err(|e| store_err("Prepare", e))?;
        let rows = stmt
            .query_map(args, |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(|e| store_err("Query", e))?;

        let mut records = Vec::new();
        for row in rows {
            let (job_id, date, status, message) = row.map_err(|e| store_err("Row", e))?;
            records.push(InvocationRecord {
                job_id,
                invocation_date: parse_date(&date)?,
                status: status.parse()?,
                message,
            });
        }
        Ok(records)
    }
}

#[async_trait]
impl StatusStore for SqliteStatusStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get(&self, job_id: &str, date: NaiveDate) -> Result<Option<InvocationRecord>> {
        let mut records = self.query(
            "SELECT job_id, invocation_date, status, message FROM invocation_records
             WHERE job_id = ?1 AND invocation_date = ?2",
            params![job_id, date.to_string()],
        )?;
        Ok(records.pop())
    }

    async fn put(
        &self,
        job_id: &str,
        date: NaiveDate,
        status: JobStatus,
        message: &str,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO invocation_records
             (job_id, invocation_date, status, message, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                job_id,
                date.to_string(),
                status.as_str(),
                message,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| store_err("Put record", e))?;
        tracing::debug!("💾 {job_id}@{date} → {status}");
        Ok(())
    }

    async fn list_by_date(&self, date: NaiveDate) -> Result<Vec<InvocationRecord>> {
        self.query(
            "SELECT job_id, invocation_date, status, message FROM invocation_records
             WHERE invocation_date = ?1 ORDER BY job_id",
            params![date.to_string()],
        )
    }

    async fn history(&self, job_id: &str, limit: usize) -> Result<Vec<InvocationRecord>> {
        self.query(
            "SELECT job_id, invocation_date, status, message FROM invocation_records
             WHERE job_id = ?1 ORDER BY invocation_date DESC LIMIT ?2",
            params![job_id, limit as i64],
        )
    }
}

fn store_err(context: &str, e: rusqlite::Error) -> JobchainError {
    JobchainError::Store(format!("{context}: {e}"))
}

fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| JobchainError::Store(format!("bad invocation_date '{raw}': {e}")))
}
