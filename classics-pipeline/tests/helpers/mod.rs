//! Test Helper Utilities
//!
//! Scripted in-process stages and a temp-dir pipeline harness

#![allow(dead_code)]

pub mod fake_stage;

pub use fake_stage::{Behavior, FakeStage};

use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

use classics_common::PipelineConfig;
use classics_pipeline::db::StateStore;
use classics_pipeline::models::{Book, NewBook, StageName};
use classics_pipeline::workflow::{Outcome, StageRegistry};
use classics_pipeline::PipelineContext;

pub const CEILING_USD: f64 = 50.0;

/// Per-stage spend used by `standard_stages`; generation totals $45
pub fn standard_cost(stage: StageName) -> f64 {
    match stage {
        StageName::SceneSelection => 5.0,
        StageName::Narration => 30.0,
        StageName::Illustration => 10.0,
        _ => 0.0,
    }
}

/// A pipeline over a temp dir. Keep it alive for the whole test.
pub struct Harness {
    pub dir: TempDir,
    pub ctx: PipelineContext,
    pub stages: Vec<Arc<FakeStage>>,
}

impl Harness {
    pub fn store(&self) -> &StateStore {
        self.ctx.store()
    }

    pub fn stage(&self, name: StageName) -> &Arc<FakeStage> {
        self.stages
            .iter()
            .find(|stage| stage.stage_name() == name)
            .expect("stage registered in harness")
    }

    pub fn artifact(&self, book_id: &str, stage: StageName) -> PathBuf {
        self.ctx.layout().output(book_id, stage)
    }

    /// Register a book whose source file exists on disk
    pub async fn register(&self, book_id: &str) -> Book {
        let source = self.dir.path().join("input").join(format!("{}.pdf", book_id));
        std::fs::create_dir_all(source.parent().unwrap()).unwrap();
        std::fs::write(&source, b"%PDF-1.4 fake").unwrap();

        self.store()
            .create_book(&NewBook {
                id: book_id.to_string(),
                title: "The Time Machine".to_string(),
                author: "H. G. Wells".to_string(),
                source_path: source.display().to_string(),
            })
            .await
            .unwrap()
    }

    pub async fn advance(&self, book_id: &str, stage: StageName) -> Outcome {
        self.ctx.runner().advance(book_id, stage, false).await.unwrap()
    }

    pub async fn book(&self, book_id: &str) -> Book {
        self.store().get_book(book_id).await.unwrap()
    }

    /// Drive a registered book through the free stages to ANALYZED
    pub async fn analyze(&self, book_id: &str) {
        for stage in [StageName::Extraction, StageName::Cleaning, StageName::StructureAnalysis] {
            let outcome = self.advance(book_id, stage).await;
            assert!(outcome.is_success(), "{} gave {:?}", stage, outcome);
        }
    }

    /// Drive a registered book to APPROVED
    pub async fn approve(&self, book_id: &str) {
        self.analyze(book_id).await;
        self.ctx.approval_gate().approve(book_id, "editor-1").await.unwrap();
    }
}

pub fn config_toml(dir: &TempDir, attempts: u32) -> String {
    format!(
        r#"
[storage]
database = {:?}
artifact_root = {:?}
max_lock_wait_ms = 5000

[budget]
ceiling_usd = {:.1}

[retry]
attempts = {}
backoff_base_ms = 1
"#,
        dir.path().join("pipeline.db").display().to_string(),
        dir.path().join("working").display().to_string(),
        CEILING_USD,
        attempts
    )
}

/// Harness with the given stages registered
pub async fn harness_with(stages: Vec<FakeStage>, attempts: u32) -> Harness {
    let dir = TempDir::new().unwrap();
    let config = PipelineConfig::from_toml_str(&config_toml(&dir, attempts)).unwrap();
    let store = StateStore::open(&config.storage).await.unwrap();

    let stages: Vec<Arc<FakeStage>> = stages.into_iter().map(Arc::new).collect();
    let mut registry = StageRegistry::new();
    for stage in &stages {
        registry.register(stage.clone());
    }

    Harness {
        ctx: PipelineContext::new(config, store, registry),
        dir,
        stages,
    }
}

/// Every stage succeeds; generation costs $5 + $30 + $10
pub fn standard_stages() -> Vec<FakeStage> {
    StageName::ALL
        .into_iter()
        .map(|stage| FakeStage::new(stage).cost(standard_cost(stage)))
        .collect()
}

/// Standard stages with one replaced
pub fn standard_stages_with(replacement: FakeStage) -> Vec<FakeStage> {
    let name = replacement.stage_name();
    let mut stages: Vec<FakeStage> = standard_stages()
        .into_iter()
        .filter(|stage| stage.stage_name() != name)
        .collect();
    stages.push(replacement);
    stages
}

pub async fn standard_harness() -> Harness {
    harness_with(standard_stages(), 3).await
}
