//! Stage workflow engine
//!
//! - `stage`: the stage contract (`Stage` trait, `StageContext`, `StageResult`)
//! - `registry`: name-keyed stage implementations
//! - `transitions`: the legal `(state, stage)` table
//! - `artifacts`: artifact paths under the artifact root
//! - `runner`: executes one stage for one book and records the outcome

pub mod artifacts;
pub mod registry;
pub mod runner;
pub mod stage;
pub mod transitions;

pub use artifacts::ArtifactLayout;
pub use registry::StageRegistry;
pub use runner::{Outcome, StageRunner};
pub use stage::{ReportedIssue, Stage, StageContext, StageResult};
