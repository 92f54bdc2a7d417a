//! Stage failure classification tests
//!
//! Transient failures retry then flag, validation failures flag, fatal
//! failures (including panics) fail the book, and operator aborts win over
//! whatever the stage reports.

mod helpers;

use classics_pipeline::models::{BookState, LogStatus, Severity, StageName};
use classics_pipeline::workflow::{Outcome, ReportedIssue};
use classics_pipeline::PipelineError;
use helpers::{harness_with, standard_stages_with, Behavior, FakeStage};

/// Retries exhaust: one log entry per attempt, flagged with a medium issue
#[tokio::test]
async fn test_transient_failures_retry_then_flag() {
    let cleaning = FakeStage::new(StageName::Cleaning)
        .then(Behavior::Transient)
        .then(Behavior::Transient)
        .then(Behavior::Transient);
    let h = harness_with(standard_stages_with(cleaning), 3).await;
    h.register("time_machine").await;
    h.advance("time_machine", StageName::Extraction).await;

    // When: every attempt fails transiently
    let outcome = h.advance("time_machine", StageName::Cleaning).await;

    // Then: flagged after three attempts
    assert!(matches!(outcome, Outcome::Flagged { state: BookState::Flagged, .. }));
    assert_eq!(outcome.exit_code(), 1);
    assert_eq!(h.stage(StageName::Cleaning).calls(), 3);

    let book = h.book("time_machine").await;
    assert_eq!(book.state, BookState::Flagged);
    assert_eq!(book.resume_state, Some(BookState::Extracted));
    assert_eq!(book.current_step, Some(StageName::Cleaning));
    assert!(book.in_progress.is_none());

    let attempts: Vec<_> = h
        .store()
        .list_log_entries("time_machine")
        .await
        .unwrap()
        .into_iter()
        .filter(|entry| entry.step == "cleaning")
        .collect();
    assert_eq!(attempts.len(), 3);
    assert!(attempts.iter().all(|entry| entry.status == LogStatus::Failure));

    let issues = h.ctx.issue_tracker().list_issues("time_machine", true).await.unwrap();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].severity, Severity::Medium);
    assert_eq!(issues[0].issue_type, "transient_failure");
    assert_eq!(issues[0].step, "cleaning");
}

/// A flagged book resumes only through the stage it is held at
#[tokio::test]
async fn test_flagged_book_resumes_at_held_stage() {
    let cleaning = FakeStage::new(StageName::Cleaning)
        .then(Behavior::Transient)
        .then(Behavior::Transient);
    let h = harness_with(standard_stages_with(cleaning), 2).await;
    h.register("time_machine").await;
    h.advance("time_machine", StageName::Extraction).await;
    h.advance("time_machine", StageName::Cleaning).await;
    assert_eq!(h.book("time_machine").await.state, BookState::Flagged);

    // A different stage may not jump the queue
    let err = h
        .ctx
        .runner()
        .advance("time_machine", StageName::StructureAnalysis, false)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::State(_)));

    // The held stage resumes without force
    let outcome = h.advance("time_machine", StageName::Cleaning).await;
    assert_eq!(outcome, Outcome::Advanced { state: BookState::Cleaned });

    let book = h.book("time_machine").await;
    assert_eq!(book.resume_state, None);
    assert_eq!(h.stage(StageName::Cleaning).calls(), 3);
}

/// Warnings still advance the book; each one is kept as a low issue
#[tokio::test]
async fn test_warnings_advance_with_low_issues() {
    let cleaning = FakeStage::new(StageName::Cleaning).then(Behavior::Warn(vec![
        "page 41 header repeated".to_string(),
        "ligature fi not mapped".to_string(),
    ]));
    let h = harness_with(standard_stages_with(cleaning), 3).await;
    h.register("time_machine").await;
    h.advance("time_machine", StageName::Extraction).await;

    let outcome = h.advance("time_machine", StageName::Cleaning).await;

    assert_eq!(outcome, Outcome::Advanced { state: BookState::Cleaned });
    assert_eq!(outcome.exit_code(), 0);

    let issues = h.ctx.issue_tracker().list_issues("time_machine", true).await.unwrap();
    assert_eq!(issues.len(), 2);
    assert!(issues.iter().all(|issue| issue.severity == Severity::Low
        && issue.issue_type == "warning"
        && issue.step == "cleaning"));

    let cleaning_log: Vec<_> = h
        .store()
        .list_log_entries("time_machine")
        .await
        .unwrap()
        .into_iter()
        .filter(|entry| entry.step == "cleaning")
        .collect();
    assert_eq!(cleaning_log.len(), 1);
    assert_eq!(cleaning_log[0].status, LogStatus::Warning);
}

/// A review that warns on an otherwise clean book holds it at the gate
#[tokio::test]
async fn test_review_warnings_flag_clean_book() {
    let review = FakeStage::new(StageName::Review)
        .then(Behavior::Warn(vec!["chapter 7 title differs from contents".to_string()]));
    let h = harness_with(standard_stages_with(review), 3).await;
    h.register("time_machine").await;
    h.analyze("time_machine").await;
    assert!(h
        .ctx
        .issue_tracker()
        .list_issues("time_machine", true)
        .await
        .unwrap()
        .is_empty());

    let outcome = h.advance("time_machine", StageName::Review).await;

    assert!(matches!(outcome, Outcome::Flagged { state: BookState::Flagged, .. }));
    let book = h.book("time_machine").await;
    assert_eq!(book.state, BookState::Flagged);
    assert_eq!(book.resume_state, Some(BookState::Analyzed));
    assert_eq!(book.current_step, Some(StageName::Review));

    // Low issues do not block the gate
    h.ctx.approval_gate().approve("time_machine", "editor-1").await.unwrap();
    assert_eq!(h.book("time_machine").await.state, BookState::Approved);
}

/// A transient success on the second attempt still advances; both attempts are charged
#[tokio::test]
async fn test_paid_retry_charges_every_attempt() {
    let narration = FakeStage::new(StageName::Narration)
        .cost(2.0)
        .then(Behavior::Transient);
    let h = harness_with(standard_stages_with(narration), 3).await;
    h.register("time_machine").await;
    h.approve("time_machine").await;
    h.advance("time_machine", StageName::SceneSelection).await;

    let outcome = h.advance("time_machine", StageName::Narration).await;

    assert_eq!(outcome, Outcome::Advanced { state: BookState::Generating });
    assert_eq!(h.stage(StageName::Narration).calls(), 2);
    assert!((h.book("time_machine").await.cost_usd - 9.0).abs() < 1e-9);
}

/// Validation problems become issues and hold the book
#[tokio::test]
async fn test_validation_failure_flags_with_reported_issues() {
    let analysis = FakeStage::new(StageName::StructureAnalysis).then(Behavior::Validation(vec![
        ReportedIssue {
            issue_type: "missing_chapters".to_string(),
            description: "Chapters 12-16 absent".to_string(),
            severity: Severity::High,
        },
        ReportedIssue {
            issue_type: "character_names".to_string(),
            description: "Weena spelled two ways".to_string(),
            severity: Severity::Low,
        },
    ]));
    let h = harness_with(standard_stages_with(analysis), 3).await;
    h.register("time_machine").await;
    h.advance("time_machine", StageName::Extraction).await;
    h.advance("time_machine", StageName::Cleaning).await;

    let outcome = h.advance("time_machine", StageName::StructureAnalysis).await;

    assert!(matches!(outcome, Outcome::Flagged { .. }));
    assert_eq!(h.stage(StageName::StructureAnalysis).calls(), 1);

    let book = h.book("time_machine").await;
    assert_eq!(book.state, BookState::Flagged);
    assert_eq!(book.resume_state, Some(BookState::Cleaned));

    let issues = h.ctx.issue_tracker().list_issues("time_machine", true).await.unwrap();
    assert_eq!(issues.len(), 2);
    assert!(issues.iter().any(|issue| issue.severity == Severity::High));

    // Not at the gate, so approval is refused
    let err = h.ctx.approval_gate().approve("time_machine", "editor-1").await.unwrap_err();
    assert!(matches!(err, PipelineError::State(_)));
}

/// Fatal failure needs a forced re-run
#[tokio::test]
async fn test_fatal_failure_requires_force() {
    let extraction = FakeStage::new(StageName::Extraction).then(Behavior::Fatal);
    let h = harness_with(standard_stages_with(extraction), 3).await;
    h.register("time_machine").await;

    let outcome = h.advance("time_machine", StageName::Extraction).await;

    assert_eq!(
        outcome,
        Outcome::Failed {
            state: BookState::Failed,
            error: "vendor rejected the request".to_string(),
        }
    );
    assert_eq!(outcome.exit_code(), 3);
    assert_eq!(h.stage(StageName::Extraction).calls(), 1);

    let book = h.book("time_machine").await;
    assert_eq!(book.state, BookState::Failed);
    assert_eq!(book.resume_state, Some(BookState::Ingested));
    assert_eq!(book.current_step, Some(StageName::Extraction));

    // Without force: refused, stage untouched
    let err = h
        .ctx
        .runner()
        .advance("time_machine", StageName::Extraction, false)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::State(_)));
    assert_eq!(h.stage(StageName::Extraction).calls(), 1);

    // With force: resumes
    let outcome = h
        .ctx
        .runner()
        .advance("time_machine", StageName::Extraction, true)
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Advanced { state: BookState::Extracted });
    assert_eq!(h.book("time_machine").await.resume_state, None);
}

/// A panicking stage fails the book and still releases the marker
#[tokio::test]
async fn test_panicking_stage_is_fatal() {
    let extraction = FakeStage::new(StageName::Extraction).then(Behavior::Panic);
    let h = harness_with(standard_stages_with(extraction), 3).await;
    h.register("time_machine").await;

    let outcome = h.advance("time_machine", StageName::Extraction).await;

    match &outcome {
        Outcome::Failed { state, error } => {
            assert_eq!(*state, BookState::Failed);
            assert!(error.contains("stage exploded"), "unexpected error: {}", error);
        }
        other => panic!("expected Failed, got {:?}", other),
    }
    let book = h.book("time_machine").await;
    assert!(book.in_progress.is_none());
    assert_eq!(h.stage(StageName::Extraction).calls(), 1);
}

/// Claiming success without writing the artifact is fatal
#[tokio::test]
async fn test_success_without_artifact_is_fatal() {
    let cleaning = FakeStage::new(StageName::Cleaning).then(Behavior::SucceedWithoutArtifact);
    let h = harness_with(standard_stages_with(cleaning), 3).await;
    h.register("time_machine").await;
    h.advance("time_machine", StageName::Extraction).await;

    let outcome = h.advance("time_machine", StageName::Cleaning).await;

    match outcome {
        Outcome::Failed { error, .. } => assert!(error.contains("did not produce")),
        other => panic!("expected Failed, got {:?}", other),
    }
    assert_eq!(h.book("time_machine").await.state, BookState::Failed);
}

/// A negative reported cost never reaches the ledger
#[tokio::test]
async fn test_invalid_cost_is_fatal() {
    let h = harness_with(
        standard_stages_with(FakeStage::new(StageName::Extraction).cost(-3.0).estimate(0.0)),
        3,
    )
    .await;
    h.register("time_machine").await;

    let outcome = h.advance("time_machine", StageName::Extraction).await;

    assert!(matches!(outcome, Outcome::Failed { .. }));
    let book = h.book("time_machine").await;
    assert_eq!(book.cost_usd, 0.0);
    assert_eq!(book.state, BookState::Failed);
}

/// An abort during the stage is observed before the next retry
#[tokio::test]
async fn test_abort_between_retries() {
    let h = harness_with(helpers::standard_stages(), 3).await;
    h.register("time_machine").await;
    h.advance("time_machine", StageName::Extraction).await;
    h.stage(StageName::Cleaning)
        .queue(Behavior::AbortThenTransient(h.store().clone()));

    let outcome = h.advance("time_machine", StageName::Cleaning).await;

    // Then: no second attempt, book stays FAILED as the operator left it
    assert_eq!(outcome, Outcome::Aborted { state: BookState::Failed });
    assert_eq!(outcome.exit_code(), 3);
    assert_eq!(h.stage(StageName::Cleaning).calls(), 1);

    let book = h.book("time_machine").await;
    assert_eq!(book.state, BookState::Failed);
    assert_eq!(book.resume_state, Some(BookState::Extracted));
    assert_eq!(book.current_step, Some(StageName::Cleaning));
    assert!(book.in_progress.is_none());
    assert!(book.notes.contains("aborted: operator stop"));

    let cleaning_log: Vec<_> = h
        .store()
        .list_log_entries("time_machine")
        .await
        .unwrap()
        .into_iter()
        .filter(|entry| entry.step == "cleaning")
        .collect();
    assert_eq!(cleaning_log.len(), 2);
    assert!(cleaning_log.iter().all(|entry| entry.status == LogStatus::Failure));

    // A forced re-run picks up where the abort left off
    let outcome = h
        .ctx
        .runner()
        .advance("time_machine", StageName::Cleaning, true)
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Advanced { state: BookState::Cleaned });
}

/// An abort during a successful run keeps the spend but not the state change
#[tokio::test]
async fn test_abort_during_success_keeps_spend() {
    let h = harness_with(helpers::standard_stages(), 3).await;
    h.register("time_machine").await;
    h.approve("time_machine").await;
    h.stage(StageName::SceneSelection)
        .queue(Behavior::AbortThenSucceed(h.store().clone()));

    let outcome = h.advance("time_machine", StageName::SceneSelection).await;

    assert_eq!(outcome, Outcome::Aborted { state: BookState::Failed });
    let book = h.book("time_machine").await;
    assert_eq!(book.state, BookState::Failed);
    assert_eq!(book.resume_state, Some(BookState::Approved));
    assert!((book.cost_usd - 5.0).abs() < 1e-9);
}

/// Deployed books cannot be aborted
#[tokio::test]
async fn test_abort_refuses_terminal_book() {
    let h = harness_with(helpers::standard_stages(), 3).await;
    h.register("time_machine").await;
    h.approve("time_machine").await;
    h.ctx.runner().run("time_machine").await.unwrap();
    assert_eq!(h.book("time_machine").await.state, BookState::Deployed);

    let err = h.store().abort_book("time_machine", "too late").await.unwrap_err();
    assert!(matches!(err, PipelineError::State(_)));
}

/// A marker that cannot be released does not hide the committed result
#[tokio::test]
async fn test_release_failure_keeps_committed_outcome() {
    let h = harness_with(helpers::standard_stages(), 3).await;
    h.register("time_machine").await;
    sqlx::query(
        r#"
        CREATE TRIGGER block_release BEFORE UPDATE OF stage_in_progress ON books
        WHEN NEW.stage_in_progress IS NULL
        BEGIN
            SELECT RAISE(ABORT, 'release blocked');
        END
        "#,
    )
    .execute(h.store().pool())
    .await
    .unwrap();

    let outcome = h.advance("time_machine", StageName::Extraction).await;

    // The attempt committed; only the marker is left behind for recovery
    assert_eq!(outcome, Outcome::Advanced { state: BookState::Extracted });
    let book = h.book("time_machine").await;
    assert_eq!(book.state, BookState::Extracted);
    assert_eq!(book.in_progress.map(|marker| marker.stage), Some(StageName::Extraction));
    assert_eq!(h.stage(StageName::Extraction).calls(), 1);
}
