//! Compel Classics pipeline core
//!
//! Orchestrates the per-book state machine that turns a source novel into a
//! narrated, illustrated learning package: the stage contract, the issue
//! ledger, the cost ledger and the approval gate.

pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod stages;
pub mod workflow;

pub use crate::error::{PipelineError, PipelineResult};

use classics_common::PipelineConfig;
use std::sync::Arc;

use crate::db::StateStore;
use crate::services::{ApprovalGate, CostLedger, IssueTracker};
use crate::workflow::{ArtifactLayout, StageRegistry, StageRunner};

/// Explicitly constructed dependencies threaded through every runner call
#[derive(Clone)]
pub struct PipelineContext {
    config: Arc<PipelineConfig>,
    store: StateStore,
    registry: Arc<StageRegistry>,
}

impl PipelineContext {
    pub fn new(config: PipelineConfig, store: StateStore, registry: StageRegistry) -> Self {
        Self {
            config: Arc::new(config),
            store,
            registry: Arc::new(registry),
        }
    }

    /// Open the configured state store and register command-backed stages
    pub async fn from_config(config: PipelineConfig) -> PipelineResult<Self> {
        let registry = stages::registry_from_config(&config)?;
        let store = StateStore::open(&config.storage).await?;
        Ok(Self::new(config, store, registry))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    pub fn layout(&self) -> ArtifactLayout {
        ArtifactLayout::new(&self.config.storage.artifact_root)
    }

    pub fn issue_tracker(&self) -> IssueTracker {
        IssueTracker::new(self.store.clone())
    }

    pub fn cost_ledger(&self) -> CostLedger {
        CostLedger::new(self.store.clone(), self.config.budget.ceiling_usd)
    }

    pub fn approval_gate(&self) -> ApprovalGate {
        ApprovalGate::new(self.store.clone())
    }

    pub fn runner(&self) -> StageRunner {
        StageRunner::new(self.clone())
    }
}
