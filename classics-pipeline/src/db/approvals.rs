//! Approval database operations
//!
//! Approvals are insert-only; the schema rejects updates and deletes.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use super::{from_db_time, now, to_db_time, StateStore};
use crate::db::books::{apply_state_change, require_book};
use crate::db::issues::count_unresolved_high;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{Approval, Book, BookState, StateChange};

fn approval_from_row(row: &SqliteRow) -> PipelineResult<Approval> {
    let approved_at: String = row.try_get("approved_at")?;
    Ok(Approval {
        book_id: row.try_get("book_id")?,
        approver_id: row.try_get("approver_id")?,
        approved_at: from_db_time("approved_at", &approved_at)?,
    })
}

pub(crate) async fn fetch_approval(conn: &mut SqliteConnection, book_id: &str) -> PipelineResult<Option<Approval>> {
    let row = sqlx::query("SELECT book_id, approver_id, approved_at FROM approvals WHERE book_id = ?")
        .bind(book_id)
        .fetch_optional(conn)
        .await?;

    row.as_ref().map(approval_from_row).transpose()
}

async fn insert_approval(
    conn: &mut SqliteConnection,
    book_id: &str,
    approver_id: &str,
    at: DateTime<Utc>,
) -> PipelineResult<()> {
    let result = sqlx::query("INSERT INTO approvals (book_id, approver_id, approved_at) VALUES (?, ?, ?)")
        .bind(book_id)
        .bind(approver_id)
        .bind(to_db_time(at))
        .execute(conn)
        .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => Err(PipelineError::State(
            format!("book '{}' is already approved", book_id),
        )),
        Err(e) => Err(e.into()),
    }
}

impl StateStore {
    pub async fn get_approval(&self, book_id: &str) -> PipelineResult<Option<Approval>> {
        let mut conn = self.pool.acquire().await?;
        fetch_approval(&mut conn, book_id).await
    }

    /// Record the approval and move the book to APPROVED in one transaction
    ///
    /// Re-checks the gate inside the transaction: the book must still be in
    /// `expected`, idle, and free of unresolved high-severity issues.
    pub async fn commit_approval(
        &self,
        book_id: &str,
        approver_id: &str,
        expected: BookState,
    ) -> PipelineResult<(Approval, Book)> {
        let approver_id = approver_id.trim();
        if approver_id.is_empty() {
            return Err(PipelineError::Validation("approver id must not be empty".to_string()));
        }
        let at = now();
        self.write("commit_approval", || async {
            let mut tx = self.pool.begin().await?;
            let book = require_book(&mut tx, book_id).await?;
            if let Some(marker) = &book.in_progress {
                return Err(PipelineError::State(format!(
                    "stage already running for book '{}' ({})",
                    book_id, marker.stage
                )));
            }

            let blocking = count_unresolved_high(&mut tx, book_id).await?;
            if blocking > 0 {
                return Err(PipelineError::State(format!(
                    "book '{}' has {} unresolved high-severity issue(s)",
                    book_id, blocking
                )));
            }

            insert_approval(&mut tx, book_id, approver_id, at).await?;

            let change = StateChange::new(expected, BookState::Approved)
                .note(format!("approved by {}", approver_id));
            if !apply_state_change(&mut tx, book_id, &change, at).await? {
                return Err(PipelineError::State(format!(
                    "book '{}' is {}, expected {}",
                    book_id, book.state, expected
                )));
            }

            let approval = fetch_approval(&mut tx, book_id)
                .await?
                .ok_or_else(|| PipelineError::Fatal(format!("approval for '{}' vanished after insert", book_id)))?;
            let book = require_book(&mut tx, book_id).await?;
            tx.commit().await?;
            Ok((approval, book))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{new_book, temp_store};

    #[tokio::test]
    async fn test_approval_is_recorded_once() {
        let (_dir, store) = temp_store().await;
        store.create_book(&new_book("time_machine")).await.unwrap();

        assert!(store.get_approval("time_machine").await.unwrap().is_none());
        let (approval, book) = store
            .commit_approval("time_machine", "editor-1", BookState::Ingested)
            .await
            .unwrap();
        assert_eq!(approval.approver_id, "editor-1");
        assert_eq!(book.state, BookState::Approved);

        // A second approval is refused by the unique key, whatever the state
        let err = store
            .commit_approval("time_machine", "editor-2", BookState::Approved)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::State(_)));

        let stored = store.get_approval("time_machine").await.unwrap().unwrap();
        assert_eq!(stored.approver_id, "editor-1");
    }

    #[tokio::test]
    async fn test_blank_approver_is_rejected() {
        let (_dir, store) = temp_store().await;
        store.create_book(&new_book("time_machine")).await.unwrap();
        let err = store
            .commit_approval("time_machine", " ", BookState::Ingested)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        assert_eq!(store.get_book("time_machine").await.unwrap().state, BookState::Ingested);
    }

    #[tokio::test]
    async fn test_commit_approval_requires_expected_state() {
        let (_dir, store) = temp_store().await;
        store.create_book(&new_book("time_machine")).await.unwrap();

        // Book is INGESTED; the insert rolls back with the failed state check
        let err = store
            .commit_approval("time_machine", "editor-1", BookState::Analyzed)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::State(_)));
        assert!(store.get_approval("time_machine").await.unwrap().is_none());
    }
}
