//! Processing log database operations (append-only)

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use super::{from_db_time, now, to_db_time, StateStore};
use crate::db::books::require_book;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{LogStatus, NewLogEntry, ProcessingLogEntry};

fn entry_from_row(row: &SqliteRow) -> PipelineResult<ProcessingLogEntry> {
    let status: String = row.try_get("status")?;
    let timestamp: String = row.try_get("timestamp")?;

    Ok(ProcessingLogEntry {
        id: row.try_get("id")?,
        book_id: row.try_get("book_id")?,
        step: row.try_get("step")?,
        status: status
            .parse::<LogStatus>()
            .map_err(|e| PipelineError::corrupt("status", e))?,
        message: row.try_get("message")?,
        duration_seconds: row.try_get("duration_seconds")?,
        timestamp: from_db_time("timestamp", &timestamp)?,
    })
}

pub(crate) async fn insert_log_entry(
    conn: &mut SqliteConnection,
    entry: &NewLogEntry,
    at: DateTime<Utc>,
) -> PipelineResult<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO processing_log (book_id, step, status, message, duration_seconds, timestamp)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&entry.book_id)
    .bind(&entry.step)
    .bind(entry.status.as_str())
    .bind(&entry.message)
    .bind(entry.duration_seconds)
    .bind(to_db_time(at))
    .execute(conn)
    .await?;

    Ok(result.last_insert_rowid())
}

impl StateStore {
    /// Append one log entry for a book
    pub async fn append_log_entry(&self, entry: &NewLogEntry) -> PipelineResult<i64> {
        let at = now();
        self.write("append_log_entry", || async {
            let mut tx = self.pool.begin().await?;
            require_book(&mut tx, &entry.book_id).await?;
            let id = insert_log_entry(&mut tx, entry, at).await?;
            tx.commit().await?;
            Ok(id)
        })
        .await
    }

    /// A book's log entries, oldest first
    pub async fn list_log_entries(&self, book_id: &str) -> PipelineResult<Vec<ProcessingLogEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, book_id, step, status, message, duration_seconds, timestamp
            FROM processing_log
            WHERE book_id = ?
            ORDER BY id
            "#,
        )
        .bind(book_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }
}
