//! Book state machine and book record
//!
//! INGESTED → EXTRACTED → CLEANED → ANALYZED → {FLAGGED | APPROVED} →
//! GENERATING → COMPLETED → DEPLOYED, plus FAILED from any non-terminal state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::models::StageName;

/// Book processing state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BookState {
    /// Source registered, nothing run yet
    Ingested,
    Extracted,
    Cleaned,
    /// Structure analysed; waiting for review or approval
    Analyzed,
    /// Unresolved problems need attention before the book can move on
    Flagged,
    /// Human approval recorded; paid generation may start
    Approved,
    /// At least one generation stage has run
    Generating,
    /// All generation artifacts exist
    Completed,
    Deployed,
    /// Fatal failure or operator abort; resumable only after intervention
    Failed,
}

impl BookState {
    pub const ALL: [BookState; 10] = [
        BookState::Ingested,
        BookState::Extracted,
        BookState::Cleaned,
        BookState::Analyzed,
        BookState::Flagged,
        BookState::Approved,
        BookState::Generating,
        BookState::Completed,
        BookState::Deployed,
        BookState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BookState::Ingested => "INGESTED",
            BookState::Extracted => "EXTRACTED",
            BookState::Cleaned => "CLEANED",
            BookState::Analyzed => "ANALYZED",
            BookState::Flagged => "FLAGGED",
            BookState::Approved => "APPROVED",
            BookState::Generating => "GENERATING",
            BookState::Completed => "COMPLETED",
            BookState::Deployed => "DEPLOYED",
            BookState::Failed => "FAILED",
        }
    }

    /// Position along the main line of the pipeline.
    ///
    /// FLAGGED and FAILED are side states and have no rank; their position is
    /// the rank of the book's resume state.
    pub fn rank(&self) -> Option<u8> {
        match self {
            BookState::Ingested => Some(0),
            BookState::Extracted => Some(1),
            BookState::Cleaned => Some(2),
            BookState::Analyzed => Some(3),
            BookState::Approved => Some(4),
            BookState::Generating => Some(5),
            BookState::Completed => Some(6),
            BookState::Deployed => Some(7),
            BookState::Flagged | BookState::Failed => None,
        }
    }

    /// Side states hold a resume state and only accept resumption
    pub fn is_holding(&self) -> bool {
        matches!(self, BookState::Flagged | BookState::Failed)
    }

    /// Check if state is terminal (no stage may move the book)
    pub fn is_terminal(&self) -> bool {
        matches!(self, BookState::Deployed | BookState::Failed)
    }

    /// Share of the seven forward transitions made once a book reaches this
    /// state. Side states report 0 here; a stored change uses the resume state.
    pub fn progress_percentage(&self) -> f64 {
        match self.rank() {
            Some(rank) => rank as f64 / 7.0 * 100.0,
            None => 0.0,
        }
    }
}

impl fmt::Display for BookState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        BookState::ALL
            .into_iter()
            .find(|state| state.as_str() == upper)
            .ok_or_else(|| format!("unknown book state '{}'", s))
    }
}

/// Per-book "stage in progress" marker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageMarker {
    /// Run token of the runner that claimed the book
    pub token: Uuid,
    pub stage: StageName,
    pub since: DateTime<Utc>,
}

/// One source-to-output processing job for a single novel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Book {
    /// Slug identifier, also the artifact directory name
    pub id: String,
    pub title: String,
    pub author: String,
    /// Registered source file (path or URI, never embedded)
    pub source_path: String,
    pub state: BookState,
    /// State to resume from while FLAGGED or FAILED
    pub resume_state: Option<BookState>,
    /// Last stage that ran (or is running)
    pub current_step: Option<StageName>,
    pub progress_percentage: f64,
    pub cost_usd: f64,
    pub notes: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
    pub in_progress: Option<StageMarker>,
}

impl Book {
    /// State used for transition lookups: the resume state while holding
    pub fn effective_state(&self) -> Option<BookState> {
        if self.state.is_holding() {
            self.resume_state
        } else {
            Some(self.state)
        }
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    /// Progress derived from the effective state
    pub fn derived_progress(&self) -> f64 {
        self.effective_state()
            .map(|state| state.progress_percentage())
            .unwrap_or(0.0)
    }
}

/// Registration request for a new book
#[derive(Debug, Clone)]
pub struct NewBook {
    pub id: String,
    pub title: String,
    pub author: String,
    pub source_path: String,
}

impl NewBook {
    /// Book ids double as directory names: lowercase ascii letters, digits, `_` and `-`
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("book id must not be empty".to_string());
        }
        if !self
            .id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
        {
            return Err(format!(
                "book id '{}' may only contain lowercase letters, digits, '_' and '-'",
                self.id
            ));
        }
        if self.title.trim().is_empty() {
            return Err("title must not be empty".to_string());
        }
        if self.source_path.trim().is_empty() {
            return Err("source path must not be empty".to_string());
        }
        Ok(())
    }
}

/// Atomic state write, applied only while the book is still in `expected`
#[derive(Debug, Clone)]
pub struct StateChange {
    pub expected: BookState,
    pub new_state: BookState,
    /// Set `current_step`; `None` leaves it unchanged
    pub current_step: Option<StageName>,
    /// Resume state to store (cleared unless the new state is holding)
    pub resume_state: Option<BookState>,
    /// Line appended to the book's notes
    pub note: Option<String>,
}

impl StateChange {
    pub fn new(expected: BookState, new_state: BookState) -> Self {
        Self {
            expected,
            new_state,
            current_step: None,
            resume_state: None,
            note: None,
        }
    }

    pub fn step(mut self, stage: StageName) -> Self {
        self.current_step = Some(stage);
        self
    }

    pub fn resume_from(mut self, state: BookState) -> Self {
        self.resume_state = Some(state);
        self
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    /// Progress to store with this change
    pub fn progress_percentage(&self) -> f64 {
        if self.new_state.is_holding() {
            self.resume_state
                .map(|state| state.progress_percentage())
                .unwrap_or(0.0)
        } else {
            self.new_state.progress_percentage()
        }
    }
}
