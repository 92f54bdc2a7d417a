//! Approval gate between free analysis and paid generation
//!
//! Approval is a one-time, immutable fact. Issues found afterwards do not
//! revoke it.

use tracing::info;

use crate::db::StateStore;
use crate::error::{PipelineError, PipelineResult};
use crate::models::approval::at_gate;
use crate::models::{Approval, ApprovalRequest};

#[derive(Clone)]
pub struct ApprovalGate {
    store: StateStore,
}

impl ApprovalGate {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Summarize what the approver needs to see. No side effects.
    pub async fn request_approval(&self, book_id: &str) -> PipelineResult<ApprovalRequest> {
        let book = self.store.get_book(book_id).await?;
        let unresolved = self.store.list_unresolved_issues(Some(book_id)).await?;
        let existing = self.store.get_approval(book_id).await?;

        Ok(ApprovalRequest {
            book_id: book.id,
            title: book.title,
            state: book.state,
            resume_state: book.resume_state,
            cost_usd: book.cost_usd,
            unresolved,
            existing,
        })
    }

    /// Record the approval and move the book to APPROVED
    ///
    /// Fails with a state error while any unresolved high-severity issue
    /// exists, when the book is not waiting at the gate, or when it was
    /// already approved.
    pub async fn approve(&self, book_id: &str, approver_id: &str) -> PipelineResult<Approval> {
        let approver_id = approver_id.trim();
        if approver_id.is_empty() {
            return Err(PipelineError::Validation("approver id must not be empty".to_string()));
        }

        let request = self.request_approval(book_id).await?;
        let book = self.store.get_book(book_id).await?;
        if book.is_archived() {
            return Err(PipelineError::State(format!("book '{}' is archived", book_id)));
        }
        if let Some(existing) = &request.existing {
            return Err(PipelineError::State(format!(
                "book '{}' was already approved by {}",
                book_id, existing.approver_id
            )));
        }
        if !at_gate(request.state, request.resume_state) {
            return Err(PipelineError::State(format!(
                "book '{}' is {} and not waiting for approval",
                book_id, request.state
            )));
        }
        let blocking: Vec<i64> = request.blocking().map(|issue| issue.id).collect();
        if !blocking.is_empty() {
            return Err(PipelineError::State(format!(
                "book '{}' has unresolved high-severity issue(s): {:?}",
                book_id, blocking
            )));
        }

        let (approval, _book) = self
            .store
            .commit_approval(book_id, approver_id, request.state)
            .await?;
        info!(book_id, approver = approver_id, "Book approved");
        Ok(approval)
    }
}
