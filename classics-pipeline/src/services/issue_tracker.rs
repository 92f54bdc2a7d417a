//! Issue tracker

use tracing::{info, warn};

use crate::db::StateStore;
use crate::error::PipelineResult;
use crate::models::{Issue, IssuePattern, NewIssue, Severity};

/// Structured record of problems found at any stage
#[derive(Clone)]
pub struct IssueTracker {
    store: StateStore,
}

impl IssueTracker {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Record an unresolved issue; fails only if the book does not exist
    pub async fn log_issue(
        &self,
        book_id: &str,
        step: &str,
        issue_type: &str,
        description: &str,
        severity: Severity,
    ) -> PipelineResult<Issue> {
        let issue = self
            .store
            .create_issue(&NewIssue {
                book_id: book_id.to_string(),
                step: step.to_string(),
                issue_type: issue_type.to_string(),
                description: description.to_string(),
                severity,
            })
            .await?;

        if severity.blocks_approval() {
            warn!(book_id, step, issue_type, issue_id = issue.id, "Logged high-severity issue");
        } else {
            info!(book_id, step, issue_type, %severity, issue_id = issue.id, "Logged issue");
        }
        Ok(issue)
    }

    /// Resolve with non-empty notes; resolution is final
    pub async fn resolve_issue(&self, issue_id: i64, notes: &str) -> PipelineResult<Issue> {
        let issue = self.store.resolve_issue(issue_id, notes).await?;
        info!(issue_id, book_id = %issue.book_id, "Resolved issue");
        Ok(issue)
    }

    /// Newest issues across all books
    pub async fn get_recent_issues(&self, limit: u32) -> PipelineResult<Vec<Issue>> {
        self.store.list_recent_issues(limit).await
    }

    /// Read-only aggregate by step and type
    pub async fn get_issue_patterns(&self) -> PipelineResult<Vec<IssuePattern>> {
        self.store.issue_patterns().await
    }

    pub async fn list_issues(&self, book_id: &str, unresolved_only: bool) -> PipelineResult<Vec<Issue>> {
        self.store.get_book(book_id).await?;
        self.store.list_issues(book_id, unresolved_only).await
    }

    pub async fn list_unresolved(&self, book_id: Option<&str>) -> PipelineResult<Vec<Issue>> {
        self.store.list_unresolved_issues(book_id).await
    }
}
