//! Issue ledger database operations

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use super::{from_db_time, from_db_time_opt, now, to_db_time, StateStore};
use crate::db::books::require_book;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{Issue, IssuePattern, NewIssue, Severity};

const ISSUE_COLUMNS: &str = r#"
    id, book_id, step, issue_type, description, severity, resolved,
    resolution_notes, created_at, resolved_at
"#;

fn issue_from_row(row: &SqliteRow) -> PipelineResult<Issue> {
    let severity: String = row.try_get("severity")?;
    let created_at: String = row.try_get("created_at")?;
    let resolved: i64 = row.try_get("resolved")?;

    Ok(Issue {
        id: row.try_get("id")?,
        book_id: row.try_get("book_id")?,
        step: row.try_get("step")?,
        issue_type: row.try_get("issue_type")?,
        description: row.try_get("description")?,
        severity: severity
            .parse::<Severity>()
            .map_err(|e| PipelineError::corrupt("severity", e))?,
        resolved: resolved != 0,
        resolution_notes: row.try_get("resolution_notes")?,
        created_at: from_db_time("created_at", &created_at)?,
        resolved_at: from_db_time_opt("resolved_at", row.try_get("resolved_at")?)?,
    })
}

pub(crate) async fn insert_issue(
    conn: &mut SqliteConnection,
    issue: &NewIssue,
    at: DateTime<Utc>,
) -> PipelineResult<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO issues (book_id, step, issue_type, description, severity, resolved, created_at)
        VALUES (?, ?, ?, ?, ?, 0, ?)
        "#,
    )
    .bind(&issue.book_id)
    .bind(&issue.step)
    .bind(&issue.issue_type)
    .bind(&issue.description)
    .bind(issue.severity.as_str())
    .bind(to_db_time(at))
    .execute(conn)
    .await?;

    Ok(result.last_insert_rowid())
}

async fn fetch_issue(conn: &mut SqliteConnection, issue_id: i64) -> PipelineResult<Option<Issue>> {
    let row = sqlx::query(&format!("SELECT {} FROM issues WHERE id = ?", ISSUE_COLUMNS))
        .bind(issue_id)
        .fetch_optional(conn)
        .await?;

    row.as_ref().map(issue_from_row).transpose()
}

pub(crate) async fn count_unresolved_high(conn: &mut SqliteConnection, book_id: &str) -> PipelineResult<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM issues WHERE book_id = ? AND resolved = 0 AND severity = 'high'",
    )
    .bind(book_id)
    .fetch_one(conn)
    .await?;

    Ok(count)
}

impl StateStore {
    /// Record a new unresolved issue
    pub async fn create_issue(&self, issue: &NewIssue) -> PipelineResult<Issue> {
        let at = now();
        self.write("create_issue", || async {
            let mut tx = self.pool.begin().await?;
            require_book(&mut tx, &issue.book_id).await?;
            let id = insert_issue(&mut tx, issue, at).await?;
            let created = fetch_issue(&mut tx, id)
                .await?
                .ok_or_else(|| PipelineError::Fatal(format!("issue {} vanished after insert", id)))?;
            tx.commit().await?;
            Ok(created)
        })
        .await
    }

    pub async fn get_issue(&self, issue_id: i64) -> PipelineResult<Issue> {
        let mut conn = self.pool.acquire().await?;
        fetch_issue(&mut conn, issue_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("issue {}", issue_id)))
    }

    /// Flip an issue to resolved. One-way; notes must be non-empty.
    pub async fn resolve_issue(&self, issue_id: i64, notes: &str) -> PipelineResult<Issue> {
        let notes = notes.trim();
        if notes.is_empty() {
            return Err(PipelineError::Validation(
                "resolution notes must not be empty".to_string(),
            ));
        }
        let resolved_at = to_db_time(now());

        self.write("resolve_issue", || async {
            let mut tx = self.pool.begin().await?;
            let issue = fetch_issue(&mut tx, issue_id)
                .await?
                .ok_or_else(|| PipelineError::NotFound(format!("issue {}", issue_id)))?;
            if issue.resolved {
                return Err(PipelineError::IssueAlreadyResolved(issue_id));
            }

            let result = sqlx::query(
                r#"
                UPDATE issues SET resolved = 1, resolution_notes = ?, resolved_at = ?
                WHERE id = ? AND resolved = 0
                "#,
            )
            .bind(notes)
            .bind(&resolved_at)
            .bind(issue_id)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() != 1 {
                return Err(PipelineError::IssueAlreadyResolved(issue_id));
            }

            let resolved = fetch_issue(&mut tx, issue_id)
                .await?
                .ok_or_else(|| PipelineError::NotFound(format!("issue {}", issue_id)))?;
            tx.commit().await?;
            Ok(resolved)
        })
        .await
    }

    /// Most recent issues across all books, newest first
    pub async fn list_recent_issues(&self, limit: u32) -> PipelineResult<Vec<Issue>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM issues ORDER BY created_at DESC, id DESC LIMIT ?",
            ISSUE_COLUMNS
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(issue_from_row).collect()
    }

    /// Unresolved issues, optionally for one book, oldest first
    pub async fn list_unresolved_issues(&self, book_id: Option<&str>) -> PipelineResult<Vec<Issue>> {
        let rows = match book_id {
            Some(book_id) => {
                sqlx::query(&format!(
                    "SELECT {} FROM issues WHERE resolved = 0 AND book_id = ? ORDER BY id",
                    ISSUE_COLUMNS
                ))
                .bind(book_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM issues WHERE resolved = 0 ORDER BY id",
                    ISSUE_COLUMNS
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(issue_from_row).collect()
    }

    /// All issues of one book, oldest first
    pub async fn list_issues(&self, book_id: &str, unresolved_only: bool) -> PipelineResult<Vec<Issue>> {
        if unresolved_only {
            return self.list_unresolved_issues(Some(book_id)).await;
        }

        let rows = sqlx::query(&format!(
            "SELECT {} FROM issues WHERE book_id = ? ORDER BY id",
            ISSUE_COLUMNS
        ))
        .bind(book_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(issue_from_row).collect()
    }

    /// Issue counts grouped by step and type, most frequent first
    pub async fn issue_patterns(&self) -> PipelineResult<Vec<IssuePattern>> {
        let rows = sqlx::query(
            r#"
            SELECT step, issue_type,
                   COUNT(*) AS total,
                   SUM(CASE WHEN resolved = 0 THEN 1 ELSE 0 END) AS unresolved
            FROM issues
            GROUP BY step, issue_type
            ORDER BY total DESC, step, issue_type
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> PipelineResult<IssuePattern> {
                Ok(IssuePattern {
                    step: row.try_get("step")?,
                    issue_type: row.try_get("issue_type")?,
                    total: row.try_get("total")?,
                    unresolved: row.try_get("unresolved")?,
                })
            })
            .collect()
    }
}
