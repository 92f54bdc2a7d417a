//! Stage attempt commits and cost writes

use super::{now, StateStore};
use crate::db::books::{apply_state_change, require_book};
use crate::db::issues::insert_issue;
use crate::db::log::insert_log_entry;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{NewIssue, NewLogEntry, StateChange};

/// Everything one stage attempt writes
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub log: NewLogEntry,
    pub issues: Vec<NewIssue>,
    /// Spend reported by the attempt, committed whatever the outcome
    pub cost_delta: f64,
    pub state_change: Option<StateChange>,
}

impl AttemptRecord {
    pub fn new(log: NewLogEntry) -> Self {
        Self {
            log,
            issues: Vec::new(),
            cost_delta: 0.0,
            state_change: None,
        }
    }
}

fn check_delta(delta: f64) -> PipelineResult<()> {
    if !delta.is_finite() || delta < 0.0 {
        return Err(PipelineError::Validation(format!(
            "cost delta must be a non-negative amount, got {}",
            delta
        )));
    }
    Ok(())
}

impl StateStore {
    /// Write one stage attempt (log entry, issues, cost, state) atomically
    ///
    /// Returns whether the state change applied. A change whose expected
    /// state no longer matches is skipped while the rest still commits, so
    /// spend and log survive a concurrent operator abort.
    pub async fn commit_attempt(&self, book_id: &str, record: &AttemptRecord) -> PipelineResult<bool> {
        check_delta(record.cost_delta)?;
        let at = now();

        self.write("commit_attempt", || async {
            let mut tx = self.pool.begin().await?;
            require_book(&mut tx, book_id).await?;

            if record.cost_delta > 0.0 {
                sqlx::query("UPDATE books SET cost_usd = cost_usd + ? WHERE id = ?")
                    .bind(record.cost_delta)
                    .bind(book_id)
                    .execute(&mut *tx)
                    .await?;
            }

            for issue in &record.issues {
                insert_issue(&mut tx, issue, at).await?;
            }
            insert_log_entry(&mut tx, &record.log, at).await?;

            let applied = match &record.state_change {
                Some(change) => apply_state_change(&mut tx, book_id, change, at).await?,
                None => true,
            };

            tx.commit().await?;
            Ok(applied)
        })
        .await
    }

    /// Add a non-negative amount to a book's spend; returns the new total
    pub async fn add_cost(&self, book_id: &str, delta: f64) -> PipelineResult<f64> {
        check_delta(delta)?;

        self.write("add_cost", || async {
            let mut tx = self.pool.begin().await?;
            let book = require_book(&mut tx, book_id).await?;
            if delta == 0.0 {
                return Ok(book.cost_usd);
            }

            sqlx::query("UPDATE books SET cost_usd = cost_usd + ? WHERE id = ?")
                .bind(delta)
                .bind(book_id)
                .execute(&mut *tx)
                .await?;
            let total: f64 = sqlx::query_scalar("SELECT cost_usd FROM books WHERE id = ?")
                .bind(book_id)
                .fetch_one(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(total)
        })
        .await
    }

    /// Sum of spend across all books
    pub async fn total_cost(&self) -> PipelineResult<f64> {
        let total: f64 = sqlx::query_scalar("SELECT COALESCE(SUM(cost_usd), 0.0) FROM books")
            .fetch_one(&self.pool)
            .await?;
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{new_book, temp_store};
    use crate::models::{BookState, LogStatus, Severity};

    #[tokio::test]
    async fn test_attempt_commits_every_part() {
        let (_dir, store) = temp_store().await;
        store.create_book(&new_book("time_machine")).await.unwrap();

        let mut record = AttemptRecord::new(NewLogEntry::new(
            "time_machine",
            "extraction",
            LogStatus::Warning,
            "1 warning",
        ));
        record.issues.push(NewIssue {
            book_id: "time_machine".to_string(),
            step: "extraction".to_string(),
            issue_type: "warning".to_string(),
            description: "page 12 unreadable".to_string(),
            severity: Severity::Low,
        });
        record.cost_delta = 0.25;
        record.state_change = Some(StateChange::new(BookState::Ingested, BookState::Extracted));

        assert!(store.commit_attempt("time_machine", &record).await.unwrap());

        let book = store.get_book("time_machine").await.unwrap();
        assert_eq!(book.state, BookState::Extracted);
        assert_eq!(book.cost_usd, 0.25);
        assert_eq!(store.list_log_entries("time_machine").await.unwrap().len(), 1);
        assert_eq!(store.list_issues("time_machine", true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_state_change_keeps_cost_and_log() {
        let (_dir, store) = temp_store().await;
        store.create_book(&new_book("time_machine")).await.unwrap();

        let mut record = AttemptRecord::new(NewLogEntry::new(
            "time_machine",
            "narration",
            LogStatus::Success,
            "ok",
        ));
        record.cost_delta = 3.0;
        record.state_change = Some(StateChange::new(BookState::Generating, BookState::Completed));

        assert!(!store.commit_attempt("time_machine", &record).await.unwrap());
        let book = store.get_book("time_machine").await.unwrap();
        assert_eq!(book.state, BookState::Ingested);
        assert_eq!(book.cost_usd, 3.0);
    }

    #[tokio::test]
    async fn test_negative_cost_is_rejected() {
        let (_dir, store) = temp_store().await;
        store.create_book(&new_book("time_machine")).await.unwrap();

        assert!(matches!(
            store.add_cost("time_machine", -1.0).await.unwrap_err(),
            PipelineError::Validation(_)
        ));
        assert!(store.add_cost("time_machine", f64::NAN).await.is_err());
        assert_eq!(store.add_cost("time_machine", 2.5).await.unwrap(), 2.5);
        assert_eq!(store.total_cost().await.unwrap(), 2.5);
    }
}
