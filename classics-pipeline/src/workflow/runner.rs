//! Stage runner
//!
//! Executes one named stage for one book:
//! 1. Plan the transition (illegal requests fail with no side effects)
//! 2. Short-circuit when the stage's artifact already exists
//! 3. Claim the per-book marker and invoke the stage, retrying transient
//!    failures with exponential backoff
//! 4. Commit log entry, issues, cost and state change of every attempt in
//!    one transaction
//! 5. Release the marker on every exit path

use serde::Serialize;
use std::any::Any;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::AttemptRecord;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{Book, BookState, LogStatus, NewIssue, NewLogEntry, Severity, StageName, StateChange};
use crate::workflow::stage::{Stage, StageContext, StageResult};
use crate::workflow::transitions::{self, Plan, Target};
use crate::PipelineContext;

/// Result of one `advance`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// Stage ran and its result was committed
    Advanced { state: BookState },
    /// Artifact already present; the stage was not invoked
    AlreadyDone { state: BookState },
    /// Validation problem or exhausted retries, recorded as issues
    Flagged { state: BookState, reason: String },
    /// Fatal failure; needs manual intervention and a forced re-run
    Failed { state: BookState, error: String },
    /// Book was aborted by an operator while the stage ran
    Aborted { state: BookState },
}

impl Outcome {
    pub fn state(&self) -> BookState {
        match self {
            Outcome::Advanced { state }
            | Outcome::AlreadyDone { state }
            | Outcome::Flagged { state, .. }
            | Outcome::Failed { state, .. }
            | Outcome::Aborted { state } => *state,
        }
    }

    /// 0 for success, 1 for flagged, 3 for failed or aborted
    pub fn exit_code(&self) -> u8 {
        match self {
            Outcome::Advanced { .. } | Outcome::AlreadyDone { .. } => 0,
            Outcome::Flagged { .. } => 1,
            Outcome::Failed { .. } | Outcome::Aborted { .. } => 3,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code() == 0
    }
}

/// Runs stages against the state store of a `PipelineContext`
#[derive(Clone)]
pub struct StageRunner {
    ctx: PipelineContext,
}

impl StageRunner {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    /// Advance `book_id` through `stage`
    pub async fn advance(&self, book_id: &str, stage: StageName, force: bool) -> PipelineResult<Outcome> {
        let store = self.ctx.store();
        let layout = self.ctx.layout();

        let book = store.get_book(book_id).await?;
        let plan = transitions::plan(&book, stage, force)?;
        let artifact_present = layout.exists(book_id, stage);

        if plan.already_passed() && artifact_present && !force {
            debug!(book_id, stage = %stage, state = %book.state, "Stage already done");
            return Ok(Outcome::AlreadyDone { state: book.state });
        }
        if plan.already_passed() && book.state == BookState::Deployed {
            return Err(PipelineError::State(format!(
                "book '{}' is DEPLOYED; re-running {} is not allowed",
                book_id, stage
            )));
        }

        let missing = layout.missing_inputs(&book, stage);
        if !missing.is_empty() {
            let missing: Vec<String> = missing.iter().map(|p| p.display().to_string()).collect();
            return Err(PipelineError::State(format!(
                "stage {} for book '{}' is missing input artifact(s): {}",
                stage,
                book_id,
                missing.join(", ")
            )));
        }

        if stage.is_paid() && matches!(plan.base, BookState::Approved | BookState::Generating) {
            if store.get_approval(book_id).await?.is_none() {
                return Err(PipelineError::State(format!(
                    "book '{}' has no approval record; generation is blocked",
                    book_id
                )));
            }
        }

        let implementation = if artifact_present && !force && !plan.resuming {
            None
        } else {
            Some(self.ctx.registry().get(stage)?)
        };

        // Claim against the planned state so a run that raced ahead wins alone
        let token = store.claim_stage(book_id, stage, plan.expected).await?;
        info!(book_id, stage = %stage, run = %token, state = %book.state, force, "Stage claimed");

        // Generation stages can leave the state at GENERATING, so the state
        // check alone does not catch a run that finished in between
        if !artifact_present && !force && layout.exists(book_id, stage) {
            let raced = Err(PipelineError::State(format!(
                "stage already running for book '{}' ({} finished by another run)",
                book_id, stage
            )));
            return self.release(book_id, token, raced).await;
        }

        let result = match implementation {
            None => self.adopt_existing_artifact(&book, stage, &plan).await,
            Some(implementation) => self.execute(&book, stage, &plan, implementation).await,
        };

        self.release(book_id, token, result).await
    }

    /// Drive a book through consecutive stages until it needs a human or
    /// stops advancing
    pub async fn run(&self, book_id: &str) -> PipelineResult<Vec<(StageName, Outcome)>> {
        let store = self.ctx.store();
        let layout = self.ctx.layout();
        let mut steps = Vec::new();

        let mut book = store.get_book(book_id).await?;
        while let Some(stage) = transitions::next_stage(&book, &layout) {
            let outcome = self.advance(book_id, stage, false).await?;
            let keep_going = outcome.is_success();
            steps.push((stage, outcome));
            if !keep_going {
                break;
            }

            book = store.get_book(book_id).await?;
            if transitions::next_stage(&book, &layout) == Some(stage) {
                break;
            }
        }

        info!(book_id, steps = steps.len(), state = %book.state, "Run finished");
        Ok(steps)
    }

    async fn release(
        &self,
        book_id: &str,
        token: Uuid,
        result: PipelineResult<Outcome>,
    ) -> PipelineResult<Outcome> {
        match (result, self.ctx.store().release_stage(book_id, token).await) {
            (Ok(outcome), Ok(_)) => Ok(outcome),
            // The attempt is committed; a stuck marker is left to `classics recover`
            (Ok(outcome), Err(release_err)) => {
                error!(book_id, run = %token, error = %release_err, "Failed to release stage marker");
                Ok(outcome)
            }
            (Err(err), Ok(_)) => Err(err),
            (Err(err), Err(release_err)) => {
                error!(book_id, run = %token, error = %release_err, "Failed to release stage marker");
                Err(err)
            }
        }
    }

    /// Artifact exists for a legal move: record the move without invoking
    async fn adopt_existing_artifact(&self, book: &Book, stage: StageName, plan: &Plan) -> PipelineResult<Outcome> {
        let new_state = self.resolve_target(&book.id, plan, 0).await?;
        let mut record = AttemptRecord::new(NewLogEntry::new(
            &book.id,
            stage.as_str(),
            LogStatus::Success,
            "artifact already present; stage not re-run",
        ));
        record.state_change = new_state.map(|state| self.state_change(plan, stage, state));

        if !self.ctx.store().commit_attempt(&book.id, &record).await? {
            return self.aborted(&book.id).await;
        }
        let state = new_state.unwrap_or(book.state);
        info!(book_id = %book.id, stage = %stage, state = %state, "Adopted existing artifact");
        Ok(Outcome::AlreadyDone { state })
    }

    async fn execute(
        &self,
        book: &Book,
        stage: StageName,
        plan: &Plan,
        implementation: Arc<dyn Stage>,
    ) -> PipelineResult<Outcome> {
        let store = self.ctx.store();
        let layout = self.ctx.layout();
        let retry = &self.ctx.config().retry;
        let book_id = book.id.as_str();
        let output = layout.output(book_id, stage);
        let estimated = implementation.estimated_cost();
        let mut attempt = 1u32;

        loop {
            if stage.is_paid() {
                if let Err(err) = self.ctx.cost_ledger().check_budget(book_id, estimated).await {
                    if matches!(err, PipelineError::BudgetExceeded { .. }) {
                        let record = AttemptRecord::new(NewLogEntry::new(
                            book_id,
                            stage.as_str(),
                            LogStatus::Failure,
                            format!("rejected before invocation: {}", err),
                        ));
                        store.commit_attempt(book_id, &record).await?;
                    }
                    return Err(err);
                }
            }

            let ctx = StageContext {
                book_id: book_id.to_string(),
                stage,
                inputs: layout.inputs(book, stage),
                output: output.clone(),
                book_dir: layout.book_dir(book_id),
                attempt,
            };

            let started = Instant::now();
            let result = sanitize(invoke(implementation.clone(), ctx).await);
            let elapsed = started.elapsed();
            let seconds = elapsed.as_secs_f64();
            let elapsed_ms = elapsed.as_millis() as u64;
            let cost = result.cost_usd();

            let log = |status: LogStatus, message: String| {
                NewLogEntry::new(book_id, stage.as_str(), status, message).duration(seconds)
            };

            match result {
                StageResult::Success { .. } | StageResult::SuccessWithWarnings { .. } if !output.is_file() => {
                    let error = format!(
                        "stage reported success but did not produce {}",
                        output.display()
                    );
                    return self.fail(book, stage, plan, log(LogStatus::Failure, error.clone()), cost, error).await;
                }

                StageResult::Success { .. } => {
                    let new_state = self.resolve_target(book_id, plan, 0).await?;
                    let mut record = AttemptRecord::new(log(
                        LogStatus::Success,
                        format!("completed in {:.2}s", seconds),
                    ));
                    record.cost_delta = cost;
                    record.state_change = new_state.map(|state| self.state_change(plan, stage, state));

                    if !store.commit_attempt(book_id, &record).await? {
                        return self.aborted(book_id).await;
                    }
                    info!(book_id, stage = %stage, attempt, elapsed_ms, cost, "Stage succeeded");
                    return Ok(self.outcome_for(new_state.unwrap_or(book.state), "issues remain after review"));
                }

                StageResult::SuccessWithWarnings { warnings, .. } => {
                    let new_state = self.resolve_target(book_id, plan, warnings.len()).await?;
                    let mut record = AttemptRecord::new(log(
                        LogStatus::Warning,
                        format!("completed with {} warning(s): {}", warnings.len(), warnings.join("; ")),
                    ));
                    record.issues = warnings
                        .iter()
                        .map(|warning| new_issue(book_id, stage, "warning", warning, Severity::Low))
                        .collect();
                    record.cost_delta = cost;
                    record.state_change = new_state.map(|state| self.state_change(plan, stage, state));

                    if !store.commit_attempt(book_id, &record).await? {
                        return self.aborted(book_id).await;
                    }
                    warn!(book_id, stage = %stage, attempt, warnings = warnings.len(), "Stage succeeded with warnings");
                    return Ok(self.outcome_for(new_state.unwrap_or(book.state), "issues remain after review"));
                }

                StageResult::TransientFailure { error, .. } if attempt < retry.attempts => {
                    let mut record = AttemptRecord::new(log(
                        LogStatus::Failure,
                        format!("attempt {}/{} failed (transient): {}", attempt, retry.attempts, error),
                    ));
                    record.cost_delta = cost;
                    store.commit_attempt(book_id, &record).await?;

                    let backoff = retry.backoff_after(attempt);
                    warn!(
                        book_id,
                        stage = %stage,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %error,
                        "Transient stage failure, will retry"
                    );
                    tokio::time::sleep(backoff).await;

                    // Abort is only observed between attempts
                    let current = store.get_book(book_id).await?;
                    if current.state != plan.expected {
                        warn!(book_id, stage = %stage, state = %current.state, "Book changed state during retry backoff");
                        return Ok(Outcome::Aborted { state: current.state });
                    }
                    attempt += 1;
                }

                StageResult::TransientFailure { error, .. } => {
                    let reason = format!(
                        "{} failed after {} attempt(s): {}",
                        stage, attempt, error
                    );
                    let mut record = AttemptRecord::new(log(
                        LogStatus::Failure,
                        format!("attempt {}/{} failed (transient), retries exhausted: {}", attempt, retry.attempts, error),
                    ));
                    record.issues = vec![new_issue(book_id, stage, "transient_failure", &reason, Severity::Medium)];
                    return self.flag(book, stage, plan, record, cost, reason).await;
                }

                StageResult::ValidationFailure { issues, .. } => {
                    let mut new_issues: Vec<NewIssue> = issues
                        .iter()
                        .map(|issue| new_issue(book_id, stage, &issue.issue_type, &issue.description, issue.severity))
                        .collect();
                    if new_issues.is_empty() {
                        new_issues.push(new_issue(
                            book_id,
                            stage,
                            "validation_failure",
                            "stage reported a validation failure without details",
                            Severity::Medium,
                        ));
                    }
                    let reason = format!("{} reported {} validation issue(s)", stage, new_issues.len());
                    let mut record = AttemptRecord::new(log(LogStatus::Failure, reason.clone()));
                    record.issues = new_issues;
                    return self.flag(book, stage, plan, record, cost, reason).await;
                }

                StageResult::FatalFailure { error } => {
                    let message = format!("fatal failure on attempt {}: {}", attempt, error);
                    return self.fail(book, stage, plan, log(LogStatus::Failure, message), cost, error).await;
                }
            }
        }
    }

    /// Concrete state for a successful run, `None` when the state stays put
    async fn resolve_target(&self, book_id: &str, plan: &Plan, new_issue_count: usize) -> PipelineResult<Option<BookState>> {
        let Some(target) = plan.target else {
            return Ok(None);
        };
        let state = match target {
            Target::To(state) => state,
            Target::ReviewGate => {
                let unresolved = self.ctx.store().list_unresolved_issues(Some(book_id)).await?;
                if unresolved.len() + new_issue_count > 0 {
                    BookState::Flagged
                } else {
                    BookState::Analyzed
                }
            }
            Target::GenerationProgress => {
                if self.ctx.layout().generation_complete(book_id) {
                    BookState::Completed
                } else {
                    BookState::Generating
                }
            }
        };
        Ok(Some(state))
    }

    fn state_change(&self, plan: &Plan, stage: StageName, new_state: BookState) -> StateChange {
        let change = StateChange::new(plan.expected, new_state).step(stage);
        if new_state == BookState::Flagged {
            // Flagged at the review gate
            change.resume_from(plan.base).note("flagged at review: unresolved issues")
        } else {
            change
        }
    }

    fn outcome_for(&self, state: BookState, flag_reason: &str) -> Outcome {
        if state == BookState::Flagged {
            Outcome::Flagged {
                state,
                reason: flag_reason.to_string(),
            }
        } else {
            Outcome::Advanced { state }
        }
    }

    async fn flag(
        &self,
        book: &Book,
        stage: StageName,
        plan: &Plan,
        mut record: AttemptRecord,
        cost: f64,
        reason: String,
    ) -> PipelineResult<Outcome> {
        record.cost_delta = cost;
        record.state_change = Some(
            StateChange::new(plan.expected, BookState::Flagged)
                .step(stage)
                .resume_from(plan.base)
                .note(format!("flagged: {}", reason)),
        );

        if !self.ctx.store().commit_attempt(&book.id, &record).await? {
            return self.aborted(&book.id).await;
        }
        warn!(book_id = %book.id, stage = %stage, reason = %reason, "Book flagged");
        Ok(Outcome::Flagged {
            state: BookState::Flagged,
            reason,
        })
    }

    async fn fail(
        &self,
        book: &Book,
        stage: StageName,
        plan: &Plan,
        log: NewLogEntry,
        cost: f64,
        error: String,
    ) -> PipelineResult<Outcome> {
        let mut record = AttemptRecord::new(log);
        record.cost_delta = cost;
        record.state_change = Some(
            StateChange::new(plan.expected, BookState::Failed)
                .step(stage)
                .resume_from(plan.base)
                .note(format!("failed at {}: {}", stage, error)),
        );

        if !self.ctx.store().commit_attempt(&book.id, &record).await? {
            return self.aborted(&book.id).await;
        }
        error!(book_id = %book.id, stage = %stage, error = %error, "Stage failed");
        Ok(Outcome::Failed {
            state: BookState::Failed,
            error,
        })
    }

    async fn aborted(&self, book_id: &str) -> PipelineResult<Outcome> {
        let book = self.ctx.store().get_book(book_id).await?;
        warn!(book_id, state = %book.state, "Book changed state while the stage ran; result kept, state left alone");
        Ok(Outcome::Aborted { state: book.state })
    }
}

fn new_issue(book_id: &str, stage: StageName, issue_type: &str, description: &str, severity: Severity) -> NewIssue {
    NewIssue {
        book_id: book_id.to_string(),
        step: stage.as_str().to_string(),
        issue_type: issue_type.to_string(),
        description: description.to_string(),
        severity,
    }
}

/// Run the stage on its own task so a panic surfaces as a fatal result
async fn invoke(implementation: Arc<dyn Stage>, ctx: StageContext) -> StageResult {
    let handle = tokio::spawn(async move { implementation.run(&ctx).await });
    match handle.await {
        Ok(result) => result,
        Err(join_err) if join_err.is_panic() => {
            StageResult::fatal(format!("stage panicked: {}", panic_message(join_err.into_panic())))
        }
        Err(join_err) => StageResult::fatal(format!("stage task did not complete: {}", join_err)),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// A negative or non-finite reported cost breaks the ledger; treat it as fatal
fn sanitize(result: StageResult) -> StageResult {
    let cost = result.cost_usd();
    if cost.is_finite() && cost >= 0.0 {
        result
    } else {
        StageResult::fatal(format!(
            "stage reported an invalid cost ({}) with a {} result",
            cost,
            result.kind()
        ))
    }
}
