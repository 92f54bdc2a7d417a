//! State store: durable record of books, issues, log entries and approvals
//!
//! Every write goes through `retry_on_lock` with the configured max lock
//! wait. Multi-row writes run in one transaction so a crash never leaves a
//! half-recorded stage attempt behind.

pub mod approvals;
pub mod attempts;
pub mod books;
pub mod issues;
pub mod log;

pub use attempts::AttemptRecord;

use chrono::{DateTime, SecondsFormat, Utc};
use classics_common::config::StorageConfig;
use classics_common::db::{init_database, retry_on_lock};
use sqlx::SqlitePool;
use std::future::Future;

use crate::error::{PipelineError, PipelineResult};

/// Handle to the SQLite state store
#[derive(Clone)]
pub struct StateStore {
    pool: SqlitePool,
    max_lock_wait_ms: u64,
}

impl StateStore {
    pub fn new(pool: SqlitePool, max_lock_wait_ms: u64) -> Self {
        Self {
            pool,
            max_lock_wait_ms,
        }
    }

    /// Open (or create) the store described by the storage config
    pub async fn open(storage: &StorageConfig) -> PipelineResult<Self> {
        let pool = init_database(&storage.database).await?;
        Ok(Self::new(pool, storage.max_lock_wait_ms))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run a write operation, retrying on lock contention
    pub(crate) async fn write<F, Fut, T>(&self, operation_name: &str, operation: F) -> PipelineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PipelineResult<T>>,
    {
        retry_on_lock(operation_name, self.max_lock_wait_ms, operation).await
    }
}

/// Timestamps are stored as fixed-width RFC 3339 UTC so they sort as text
pub(crate) fn to_db_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn from_db_time(column: &str, value: &str) -> PipelineResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|time| time.with_timezone(&Utc))
        .map_err(|e| PipelineError::corrupt(column, e))
}

pub(crate) fn from_db_time_opt(column: &str, value: Option<String>) -> PipelineResult<Option<DateTime<Utc>>> {
    value.map(|v| from_db_time(column, &v)).transpose()
}

/// Current time, truncated to the stored precision
pub(crate) fn now() -> DateTime<Utc> {
    let now = Utc::now();
    // Round-trip so in-memory values equal what a later read returns
    DateTime::parse_from_rfc3339(&to_db_time(now))
        .map(|time| time.with_timezone(&Utc))
        .unwrap_or(now)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::StateStore;
    use crate::models::NewBook;
    use tempfile::TempDir;

    /// Fresh store in a temp dir; keep the TempDir alive for the test
    pub async fn temp_store() -> (TempDir, StateStore) {
        let dir = TempDir::new().unwrap();
        let pool = classics_common::db::init_database(&dir.path().join("pipeline.db"))
            .await
            .unwrap();
        (dir, StateStore::new(pool, 5000))
    }

    pub fn new_book(id: &str) -> NewBook {
        NewBook {
            id: id.to_string(),
            title: "The Time Machine".to_string(),
            author: "H. G. Wells".to_string(),
            source_path: "input/time_machine.pdf".to_string(),
        }
    }
}
