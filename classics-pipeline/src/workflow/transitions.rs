//! Transition table
//!
//! | stage              | legal from           | to                          |
//! |--------------------|----------------------|-----------------------------|
//! | extraction         | INGESTED             | EXTRACTED                   |
//! | cleaning           | EXTRACTED            | CLEANED                     |
//! | structure_analysis | CLEANED              | ANALYZED                    |
//! | review             | ANALYZED             | ANALYZED or FLAGGED         |
//! | generation stages  | APPROVED, GENERATING | GENERATING or COMPLETED     |
//! | deployment         | COMPLETED            | DEPLOYED                    |
//!
//! APPROVED is only reachable through the approval gate, never by a stage.

use crate::error::{PipelineError, PipelineResult};
use crate::models::{Book, BookState, StageName};
use crate::workflow::artifacts::ArtifactLayout;

/// Where a successful run moves the book
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    To(BookState),
    /// FLAGGED if any unresolved issue exists, else ANALYZED
    ReviewGate,
    /// COMPLETED once all generation artifacts exist, else GENERATING
    GenerationProgress,
}

/// Resolved request for one `(book, stage)` pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plan {
    /// State the final compare-and-set expects (the book's stored state)
    pub expected: BookState,
    /// State the transition is looked up from (resume state while holding)
    pub base: BookState,
    /// `None`: the book already passed this stage; a re-run leaves state alone
    pub target: Option<Target>,
    /// Book is FLAGGED or FAILED and this run resumes it
    pub resuming: bool,
}

impl Plan {
    pub fn already_passed(&self) -> bool {
        self.target.is_none()
    }
}

/// Legal move for `stage` out of `state`, if any
pub fn legal_move(state: BookState, stage: StageName) -> Option<Target> {
    use BookState::*;
    use StageName::*;

    match (stage, state) {
        (Extraction, Ingested) => Some(Target::To(Extracted)),
        (Cleaning, Extracted) => Some(Target::To(Cleaned)),
        (StructureAnalysis, Cleaned) => Some(Target::To(Analyzed)),
        (Review, Analyzed) => Some(Target::ReviewGate),
        (SceneSelection | Narration | Illustration, Approved | Generating) => {
            Some(Target::GenerationProgress)
        }
        (Deployment, Completed) => Some(Target::To(Deployed)),
        _ => None,
    }
}

/// Rank of the state that marks `stage` as done
fn done_rank(stage: StageName) -> u8 {
    match stage {
        StageName::Extraction => 1,
        StageName::Cleaning => 2,
        StageName::StructureAnalysis | StageName::Review => 3,
        StageName::SceneSelection | StageName::Narration | StageName::Illustration => 6,
        StageName::Deployment => 7,
    }
}

/// Work out what advancing `book` through `stage` means
///
/// Fails with a state error (no side effects) when the request is illegal.
pub fn plan(book: &Book, stage: StageName, force: bool) -> PipelineResult<Plan> {
    if book.is_archived() {
        return Err(PipelineError::State(format!("book '{}' is archived", book.id)));
    }

    let resuming = book.state.is_holding();
    let base = if resuming {
        if book.state == BookState::Failed && !force {
            return Err(PipelineError::State(format!(
                "book '{}' is FAILED at {}; re-run it with force after manual intervention",
                book.id,
                describe_step(book.current_step)
            )));
        }
        book.resume_state.ok_or_else(|| {
            PipelineError::State(format!("book '{}' is {} without a resume state", book.id, book.state))
        })?
    } else {
        book.state
    };

    if let Some(target) = legal_move(base, stage) {
        if resuming && book.current_step.is_some_and(|step| step != stage) {
            return Err(held_at(book, stage));
        }
        return Ok(Plan {
            expected: book.state,
            base,
            target: Some(target),
            resuming,
        });
    }

    let passed = base.rank().is_some_and(|rank| done_rank(stage) <= rank);
    if !passed {
        return Err(PipelineError::State(format!(
            "stage {} is not legal for book '{}' in state {}",
            stage, book.id, base
        )));
    }

    if resuming {
        // Resuming an already-passed stage returns the book to its resume state
        if book.current_step != Some(stage) {
            return Err(held_at(book, stage));
        }
        return Ok(Plan {
            expected: book.state,
            base,
            target: Some(Target::To(base)),
            resuming,
        });
    }

    Ok(Plan {
        expected: book.state,
        base,
        target: None,
        resuming,
    })
}

fn describe_step(step: Option<StageName>) -> String {
    step.map(|s| s.to_string()).unwrap_or_else(|| "registration".to_string())
}

fn held_at(book: &Book, stage: StageName) -> PipelineError {
    PipelineError::State(format!(
        "book '{}' is {} at {}; only that stage may resume it, not {}",
        book.id,
        book.state,
        describe_step(book.current_step),
        stage
    ))
}

/// Next stage `run` should attempt, or `None` when the book needs a human
/// (approval, flagged, failed) or is finished
pub fn next_stage(book: &Book, layout: &ArtifactLayout) -> Option<StageName> {
    if book.is_archived() {
        return None;
    }
    match book.state {
        BookState::Ingested => Some(StageName::Extraction),
        BookState::Extracted => Some(StageName::Cleaning),
        BookState::Cleaned => Some(StageName::StructureAnalysis),
        BookState::Analyzed => {
            (!layout.exists(&book.id, StageName::Review)).then_some(StageName::Review)
        }
        BookState::Approved | BookState::Generating => StageName::GENERATION
            .into_iter()
            .find(|stage| !layout.exists(&book.id, *stage)),
        BookState::Completed => Some(StageName::Deployment),
        BookState::Deployed | BookState::Flagged | BookState::Failed => None,
    }
}
