//! Book database operations

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tracing::{info, warn};
use uuid::Uuid;

use super::{from_db_time, from_db_time_opt, now, to_db_time, StateStore};
use crate::db::log::insert_log_entry;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{
    Book, BookState, LogStatus, NewBook, NewLogEntry, StageMarker, StageName, StateChange,
};

const BOOK_COLUMNS: &str = r#"
    id, title, author, source_path, state, resume_state, current_step,
    progress_percentage, cost_usd, notes, created_at, started_at, completed_at,
    archived_at, stage_in_progress, in_progress_stage, in_progress_since
"#;

fn parse_state(column: &str, value: &str) -> PipelineResult<BookState> {
    value.parse().map_err(|e: String| PipelineError::corrupt(column, e))
}

fn parse_stage(column: &str, value: &str) -> PipelineResult<StageName> {
    value.parse().map_err(|e: String| PipelineError::corrupt(column, e))
}

pub(crate) fn book_from_row(row: &SqliteRow) -> PipelineResult<Book> {
    let state: String = row.try_get("state")?;
    let resume_state: Option<String> = row.try_get("resume_state")?;
    let current_step: Option<String> = row.try_get("current_step")?;
    let created_at: String = row.try_get("created_at")?;

    let token: Option<String> = row.try_get("stage_in_progress")?;
    let in_progress = match token {
        Some(token) => {
            let token = Uuid::parse_str(&token).map_err(|e| PipelineError::corrupt("stage_in_progress", e))?;
            let stage: Option<String> = row.try_get("in_progress_stage")?;
            let since: Option<String> = row.try_get("in_progress_since")?;
            let stage = stage.ok_or_else(|| PipelineError::corrupt("in_progress_stage", "missing"))?;
            let since = since.ok_or_else(|| PipelineError::corrupt("in_progress_since", "missing"))?;
            Some(StageMarker {
                token,
                stage: parse_stage("in_progress_stage", &stage)?,
                since: from_db_time("in_progress_since", &since)?,
            })
        }
        None => None,
    };

    Ok(Book {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        author: row.try_get("author")?,
        source_path: row.try_get("source_path")?,
        state: parse_state("state", &state)?,
        resume_state: resume_state
            .map(|s| parse_state("resume_state", &s))
            .transpose()?,
        current_step: current_step
            .map(|s| parse_stage("current_step", &s))
            .transpose()?,
        progress_percentage: row.try_get("progress_percentage")?,
        cost_usd: row.try_get("cost_usd")?,
        notes: row.try_get("notes")?,
        created_at: from_db_time("created_at", &created_at)?,
        started_at: from_db_time_opt("started_at", row.try_get("started_at")?)?,
        completed_at: from_db_time_opt("completed_at", row.try_get("completed_at")?)?,
        archived_at: from_db_time_opt("archived_at", row.try_get("archived_at")?)?,
        in_progress,
    })
}

pub(crate) async fn fetch_book(conn: &mut SqliteConnection, book_id: &str) -> PipelineResult<Option<Book>> {
    let row = sqlx::query(&format!("SELECT {} FROM books WHERE id = ?", BOOK_COLUMNS))
        .bind(book_id)
        .fetch_optional(conn)
        .await?;

    row.as_ref().map(book_from_row).transpose()
}

pub(crate) async fn require_book(conn: &mut SqliteConnection, book_id: &str) -> PipelineResult<Book> {
    fetch_book(conn, book_id)
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("book '{}'", book_id)))
}

/// Compare-and-set state write. Returns false when the book is not in
/// `change.expected` (or does not exist).
pub(crate) async fn apply_state_change(
    conn: &mut SqliteConnection,
    book_id: &str,
    change: &StateChange,
    at: DateTime<Utc>,
) -> PipelineResult<bool> {
    let resume_state = if change.new_state.is_holding() {
        change.resume_state.map(|s| s.as_str())
    } else {
        None
    };
    let completed_at = (change.new_state == BookState::Completed).then(|| to_db_time(at));

    let result = sqlx::query(
        r#"
        UPDATE books SET
            state = ?,
            resume_state = ?,
            current_step = COALESCE(?, current_step),
            progress_percentage = ?,
            completed_at = COALESCE(completed_at, ?),
            notes = CASE
                WHEN ? IS NULL THEN notes
                WHEN notes = '' THEN ?
                ELSE notes || char(10) || ?
            END
        WHERE id = ? AND state = ?
        "#,
    )
    .bind(change.new_state.as_str())
    .bind(resume_state)
    .bind(change.current_step.map(|s| s.as_str()))
    .bind(change.progress_percentage())
    .bind(completed_at)
    .bind(change.note.as_deref())
    .bind(change.note.as_deref())
    .bind(change.note.as_deref())
    .bind(book_id)
    .bind(change.expected.as_str())
    .execute(conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

impl StateStore {
    /// Register a new book in INGESTED
    pub async fn create_book(&self, new_book: &NewBook) -> PipelineResult<Book> {
        new_book.validate().map_err(PipelineError::Validation)?;
        let created_at = now();

        self.write("create_book", || async {
            let result = sqlx::query(
                r#"
                INSERT INTO books (id, title, author, source_path, state, progress_percentage, created_at)
                VALUES (?, ?, ?, ?, ?, 0.0, ?)
                "#,
            )
            .bind(&new_book.id)
            .bind(&new_book.title)
            .bind(&new_book.author)
            .bind(&new_book.source_path)
            .bind(BookState::Ingested.as_str())
            .bind(to_db_time(created_at))
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => Ok(()),
                Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => Err(
                    PipelineError::State(format!("book '{}' is already registered", new_book.id)),
                ),
                Err(e) => Err(e.into()),
            }
        })
        .await?;

        info!(book_id = %new_book.id, title = %new_book.title, "Registered book");
        self.get_book(&new_book.id).await
    }

    pub async fn find_book(&self, book_id: &str) -> PipelineResult<Option<Book>> {
        let mut conn = self.pool.acquire().await?;
        fetch_book(&mut conn, book_id).await
    }

    pub async fn get_book(&self, book_id: &str) -> PipelineResult<Book> {
        let mut conn = self.pool.acquire().await?;
        require_book(&mut conn, book_id).await
    }

    /// All books in registration order; archived books only on request
    pub async fn list_books(&self, include_archived: bool) -> PipelineResult<Vec<Book>> {
        let sql = if include_archived {
            format!("SELECT {} FROM books ORDER BY created_at, id", BOOK_COLUMNS)
        } else {
            format!(
                "SELECT {} FROM books WHERE archived_at IS NULL ORDER BY created_at, id",
                BOOK_COLUMNS
            )
        };

        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(book_from_row).collect()
    }

    /// Atomic single-record state write, applied only if the book is still
    /// in `change.expected`
    pub async fn update_book_state(&self, book_id: &str, change: &StateChange) -> PipelineResult<Book> {
        let at = now();
        self.write("update_book_state", || async {
            let mut tx = self.pool.begin().await?;
            if !apply_state_change(&mut tx, book_id, change, at).await? {
                let book = require_book(&mut tx, book_id).await?;
                return Err(PipelineError::State(format!(
                    "book '{}' is {}, expected {}",
                    book_id, book.state, change.expected
                )));
            }
            let book = require_book(&mut tx, book_id).await?;
            tx.commit().await?;
            Ok(book)
        })
        .await
    }

    /// Set the per-book "stage in progress" marker if it is clear and the
    /// book is still in `expected`
    ///
    /// Returns the run token identifying this claim. A claim that finds the
    /// marker set, or finds that another run already moved the book out of
    /// `expected`, fails with "stage already running".
    pub async fn claim_stage(
        &self,
        book_id: &str,
        stage: StageName,
        expected: BookState,
    ) -> PipelineResult<Uuid> {
        let token = Uuid::new_v4();
        let since = to_db_time(now());

        self.write("claim_stage", || async {
            let result = sqlx::query(
                r#"
                UPDATE books SET
                    stage_in_progress = ?,
                    in_progress_stage = ?,
                    in_progress_since = ?,
                    started_at = COALESCE(started_at, ?)
                WHERE id = ? AND stage_in_progress IS NULL AND state = ? AND archived_at IS NULL
                "#,
            )
            .bind(token.to_string())
            .bind(stage.as_str())
            .bind(&since)
            .bind(&since)
            .bind(book_id)
            .bind(expected.as_str())
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                return Ok(());
            }

            let book = self.get_book(book_id).await?;
            if book.is_archived() {
                return Err(PipelineError::State(format!("book '{}' is archived", book_id)));
            }
            let detail = match book.in_progress {
                Some(marker) => format!(" ({} since {})", marker.stage, to_db_time(marker.since)),
                None => format!(" (another run moved it from {} to {})", expected, book.state),
            };
            Err(PipelineError::State(format!(
                "stage already running for book '{}'{}",
                book_id, detail
            )))
        })
        .await?;

        Ok(token)
    }

    /// Clear the marker, but only if `token` still owns it
    pub async fn release_stage(&self, book_id: &str, token: Uuid) -> PipelineResult<bool> {
        self.write("release_stage", || async {
            let result = sqlx::query(
                r#"
                UPDATE books SET
                    stage_in_progress = NULL,
                    in_progress_stage = NULL,
                    in_progress_since = NULL
                WHERE id = ? AND stage_in_progress = ?
                "#,
            )
            .bind(book_id)
            .bind(token.to_string())
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    /// Books whose marker has been set longer than `older_than`
    pub async fn list_stale_markers(&self, older_than: chrono::Duration) -> PipelineResult<Vec<Book>> {
        let cutoff = to_db_time(Utc::now() - older_than);
        let rows = sqlx::query(&format!(
            "SELECT {} FROM books WHERE stage_in_progress IS NOT NULL AND in_progress_since <= ? ORDER BY in_progress_since",
            BOOK_COLUMNS
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(book_from_row).collect()
    }

    /// Operator-forced marker clear after a crash. Appends a warning log
    /// entry so the recovery is visible in the book's history.
    pub async fn clear_stale_marker(&self, book_id: &str) -> PipelineResult<Option<StageMarker>> {
        let at = now();
        let marker = self
            .write("clear_stale_marker", || async {
                let mut tx = self.pool.begin().await?;
                let book = require_book(&mut tx, book_id).await?;
                let Some(marker) = book.in_progress else {
                    return Ok(None);
                };

                sqlx::query(
                    r#"
                    UPDATE books SET
                        stage_in_progress = NULL,
                        in_progress_stage = NULL,
                        in_progress_since = NULL
                    WHERE id = ? AND stage_in_progress = ?
                    "#,
                )
                .bind(book_id)
                .bind(marker.token.to_string())
                .execute(&mut *tx)
                .await?;

                let entry = NewLogEntry::new(
                    book_id,
                    marker.stage.as_str(),
                    LogStatus::Warning,
                    format!(
                        "cleared stale in-progress marker (run {} since {})",
                        marker.token,
                        to_db_time(marker.since)
                    ),
                );
                insert_log_entry(&mut tx, &entry, at).await?;
                tx.commit().await?;
                Ok(Some(marker))
            })
            .await?;

        if let Some(marker) = &marker {
            warn!(book_id, stage = %marker.stage, run = %marker.token, "Cleared stale stage marker");
        }
        Ok(marker)
    }

    /// Hide a book from listings and refuse further advances
    pub async fn archive_book(&self, book_id: &str) -> PipelineResult<Book> {
        let archived_at = to_db_time(now());
        self.write("archive_book", || async {
            let mut tx = self.pool.begin().await?;
            let book = require_book(&mut tx, book_id).await?;
            if book.is_archived() {
                return Err(PipelineError::State(format!("book '{}' is already archived", book_id)));
            }
            if let Some(marker) = &book.in_progress {
                return Err(PipelineError::State(format!(
                    "book '{}' has {} in progress",
                    book_id, marker.stage
                )));
            }

            sqlx::query("UPDATE books SET archived_at = ? WHERE id = ? AND archived_at IS NULL")
                .bind(&archived_at)
                .bind(book_id)
                .execute(&mut *tx)
                .await?;
            let book = require_book(&mut tx, book_id).await?;
            tx.commit().await?;
            Ok(book)
        })
        .await
    }

    /// Operator abort: move the book to FAILED out of band
    ///
    /// A running stage is not interrupted; the runner notices the state
    /// change between retry attempts and at its final compare-and-set.
    pub async fn abort_book(&self, book_id: &str, reason: &str) -> PipelineResult<Book> {
        let at = now();
        let book = self
            .write("abort_book", || async {
                let mut tx = self.pool.begin().await?;
                let book = require_book(&mut tx, book_id).await?;
                if book.state.is_terminal() {
                    return Err(PipelineError::State(format!(
                        "book '{}' is {} and cannot be aborted",
                        book_id, book.state
                    )));
                }

                let resume_from = book.effective_state().unwrap_or(book.state);
                let note = format!("aborted: {}", reason);
                let mut change = StateChange::new(book.state, BookState::Failed)
                    .resume_from(resume_from)
                    .note(note.clone());
                // The interrupted stage is the one a forced re-run resumes
                if let Some(marker) = &book.in_progress {
                    change = change.step(marker.stage);
                }
                apply_state_change(&mut tx, book_id, &change, at).await?;

                let step = book
                    .in_progress
                    .as_ref()
                    .map(|marker| marker.stage)
                    .or(book.current_step)
                    .map(|stage| stage.as_str())
                    .unwrap_or("abort");
                insert_log_entry(
                    &mut tx,
                    &NewLogEntry::new(book_id, step, LogStatus::Failure, note),
                    at,
                )
                .await?;

                let book = require_book(&mut tx, book_id).await?;
                tx.commit().await?;
                Ok(book)
            })
            .await?;

        warn!(book_id, reason, "Book aborted by operator");
        Ok(book)
    }
}
