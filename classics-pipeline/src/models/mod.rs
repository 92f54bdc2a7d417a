//! Data models for the pipeline core
//!
//! - Book state machine states and the book record
//! - Stage names with their declared artifacts
//! - Issue, processing log and approval records

pub mod approval;
pub mod book;
pub mod issue;
pub mod log_entry;
pub mod stage;

pub use approval::{Approval, ApprovalRequest};
pub use book::{Book, BookState, NewBook, StageMarker, StateChange};
pub use issue::{Issue, IssuePattern, NewIssue, Severity};
pub use log_entry::{LogStatus, NewLogEntry, ProcessingLogEntry};
pub use stage::StageName;
