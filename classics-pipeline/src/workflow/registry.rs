//! Name-keyed stage registry

use std::collections::HashMap;
use std::sync::Arc;

use super::stage::Stage;
use crate::error::{PipelineError, PipelineResult};
use crate::models::StageName;

#[derive(Clone, Default)]
pub struct StageRegistry {
    stages: HashMap<StageName, Arc<dyn Stage>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an implementation under its own name, replacing any previous one
    pub fn register(&mut self, stage: Arc<dyn Stage>) -> &mut Self {
        self.stages.insert(stage.name(), stage);
        self
    }

    pub fn with(mut self, stage: Arc<dyn Stage>) -> Self {
        self.register(stage);
        self
    }

    pub fn get(&self, name: StageName) -> PipelineResult<Arc<dyn Stage>> {
        self.stages.get(&name).cloned().ok_or_else(|| {
            PipelineError::State(format!("no implementation registered for stage {}", name))
        })
    }

    pub fn contains(&self, name: StageName) -> bool {
        self.stages.contains_key(&name)
    }

    /// Registered stage names in pipeline order
    pub fn names(&self) -> Vec<StageName> {
        StageName::ALL
            .into_iter()
            .filter(|name| self.stages.contains_key(name))
            .collect()
    }
}

impl std::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRegistry").field("stages", &self.names()).finish()
    }
}
