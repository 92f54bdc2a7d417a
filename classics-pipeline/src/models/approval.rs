//! Approval gate records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{BookState, Issue, Severity};

/// Whether a book in `state` may be approved
pub fn at_gate(state: BookState, resume_state: Option<BookState>) -> bool {
    match state {
        BookState::Analyzed => true,
        BookState::Flagged => resume_state == Some(BookState::Analyzed),
        _ => false,
    }
}

/// Immutable approval fact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub book_id: String,
    pub approver_id: String,
    pub approved_at: DateTime<Utc>,
}

/// What a human needs to see before approving a book
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub book_id: String,
    pub title: String,
    pub state: BookState,
    pub resume_state: Option<BookState>,
    pub cost_usd: f64,
    pub unresolved: Vec<Issue>,
    pub existing: Option<Approval>,
}

impl ApprovalRequest {
    /// Unresolved issues that block approval
    pub fn blocking(&self) -> impl Iterator<Item = &Issue> {
        self.unresolved.iter().filter(|issue| issue.severity.blocks_approval())
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.unresolved.iter().filter(|issue| issue.severity == severity).count()
    }

    /// ANALYZED, or FLAGGED while waiting at the review gate
    pub fn at_gate(&self) -> bool {
        at_gate(self.state, self.resume_state)
    }

    /// True when `approve` would currently succeed
    pub fn can_approve(&self) -> bool {
        self.at_gate() && self.existing.is_none() && self.blocking().next().is_none()
    }
}
