//! Error types for the pipeline core
//!
//! Validation failures and exhausted transient failures reported by a stage
//! never surface here: the runner absorbs them into the issue ledger and
//! reports them as an `Outcome`. These variants are what propagates to the
//! caller.

use classics_common::db::LockContention;
use thiserror::Error;

/// Pipeline error type
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Illegal transition or request in the book's current state (no side effect)
    #[error("State error: {0}")]
    State(String),

    /// Invalid caller input (e.g. empty resolution notes)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Resolution of an issue that is already resolved
    #[error("Issue {0} is already resolved")]
    IssueAlreadyResolved(i64),

    /// Prospective cost check failed; nothing was spent
    #[error(
        "Budget exceeded for {book_id}: current ${current:.2} + estimated ${estimated:.2} > ceiling ${ceiling:.2}"
    )]
    BudgetExceeded {
        book_id: String,
        current: f64,
        estimated: f64,
        ceiling: f64,
    },

    /// Unexpected internal failure
    #[error("Fatal error: {0}")]
    Fatal(String),

    /// Book or issue not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Infrastructure error (database, I/O, configuration)
    #[error(transparent)]
    Common(#[from] classics_common::Error),
}

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        PipelineError::Common(classics_common::Error::Database(err))
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Common(classics_common::Error::Io(err))
    }
}

impl LockContention for PipelineError {
    fn is_lock_contention(&self) -> bool {
        match self {
            PipelineError::Common(err) => err.is_lock_contention(),
            _ => false,
        }
    }
}

impl PipelineError {
    /// Process exit code for this error
    ///
    /// 1: illegal state, validation, not found, configuration.
    /// 2: budget exceeded.
    /// 3: fatal and internal storage failures.
    pub fn exit_code(&self) -> u8 {
        match self {
            PipelineError::State(_)
            | PipelineError::Validation(_)
            | PipelineError::IssueAlreadyResolved(_)
            | PipelineError::NotFound(_) => 1,
            PipelineError::BudgetExceeded { .. } => 2,
            PipelineError::Fatal(_) => 3,
            PipelineError::Common(err) => common_exit_code(err),
        }
    }

    /// Row decoding failure
    pub(crate) fn corrupt(what: &str, detail: impl std::fmt::Display) -> Self {
        PipelineError::Common(classics_common::Error::Internal(format!(
            "Failed to decode {}: {}",
            what, detail
        )))
    }
}

/// Exit code for an infrastructure error: caller mistakes 1, storage failures 3
pub fn common_exit_code(err: &classics_common::Error) -> u8 {
    match err {
        classics_common::Error::Config(_)
        | classics_common::Error::NotFound(_)
        | classics_common::Error::InvalidInput(_) => 1,
        classics_common::Error::Database(_)
        | classics_common::Error::Io(_)
        | classics_common::Error::Internal(_) => 3,
    }
}

/// Result type for pipeline operations
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
