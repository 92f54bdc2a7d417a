//! Stage contract
//!
//! A stage is a function of `(book_id, input artifact paths)` returning a
//! typed `StageResult`. Stages never touch the state store; the runner
//! records whatever they report.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::models::{Severity, StageName};

/// Everything a stage implementation receives for one attempt
#[derive(Debug, Clone)]
pub struct StageContext {
    pub book_id: String,
    pub stage: StageName,
    /// Input artifact paths, in `StageName::input_stages` order (extraction
    /// receives the registered source file)
    pub inputs: Vec<PathBuf>,
    /// Declared output artifact the stage must produce
    pub output: PathBuf,
    /// `<artifact_root>/<book_id>/`
    pub book_dir: PathBuf,
    /// 1-based attempt number within this advance
    pub attempt: u32,
}

/// Problem reported by a stage's own quality checks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportedIssue {
    pub issue_type: String,
    pub description: String,
    pub severity: Severity,
}

/// Typed outcome of one stage invocation
#[derive(Debug, Clone, PartialEq)]
pub enum StageResult {
    Success {
        outputs: Vec<PathBuf>,
        cost_usd: f64,
    },
    SuccessWithWarnings {
        outputs: Vec<PathBuf>,
        warnings: Vec<String>,
        cost_usd: f64,
    },
    /// Retryable I/O or network fault
    TransientFailure { error: String, cost_usd: f64 },
    /// Output failed a quality check; not retried
    ValidationFailure {
        issues: Vec<ReportedIssue>,
        cost_usd: f64,
    },
    /// Unexpected internal failure; never retried
    FatalFailure { error: String },
}

impl StageResult {
    pub fn success(cost_usd: f64) -> Self {
        StageResult::Success {
            outputs: Vec::new(),
            cost_usd,
        }
    }

    pub fn transient(error: impl Into<String>) -> Self {
        StageResult::TransientFailure {
            error: error.into(),
            cost_usd: 0.0,
        }
    }

    pub fn fatal(error: impl Into<String>) -> Self {
        StageResult::FatalFailure { error: error.into() }
    }

    /// Spend reported by this attempt
    pub fn cost_usd(&self) -> f64 {
        match self {
            StageResult::Success { cost_usd, .. }
            | StageResult::SuccessWithWarnings { cost_usd, .. }
            | StageResult::TransientFailure { cost_usd, .. }
            | StageResult::ValidationFailure { cost_usd, .. } => *cost_usd,
            StageResult::FatalFailure { .. } => 0.0,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StageResult::Success { .. } => "success",
            StageResult::SuccessWithWarnings { .. } => "warning",
            StageResult::TransientFailure { .. } => "transient",
            StageResult::ValidationFailure { .. } => "validation",
            StageResult::FatalFailure { .. } => "fatal",
        }
    }
}

/// Pluggable stage implementation
///
/// # Example
/// ```rust,ignore
/// struct Extraction;
///
/// #[async_trait::async_trait]
/// impl Stage for Extraction {
///     fn name(&self) -> StageName { StageName::Extraction }
///
///     async fn run(&self, ctx: &StageContext) -> StageResult {
///         match extract_text(&ctx.inputs[0], &ctx.output).await {
///             Ok(()) => StageResult::success(0.0),
///             Err(e) => StageResult::fatal(e.to_string()),
///         }
///     }
/// }
/// ```
#[async_trait::async_trait]
pub trait Stage: Send + Sync {
    /// Stage this implementation serves
    fn name(&self) -> StageName;

    /// Expected spend per attempt, used by the prospective budget check
    fn estimated_cost(&self) -> f64 {
        0.0
    }

    /// Run one attempt. Panics are caught by the runner and treated as fatal.
    async fn run(&self, ctx: &StageContext) -> StageResult;
}
