//! Scripted stage implementation for runner tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use classics_pipeline::db::StateStore;
use classics_pipeline::models::StageName;
use classics_pipeline::workflow::{ReportedIssue, Stage, StageContext, StageResult};

/// What one invocation does
#[derive(Clone)]
pub enum Behavior {
    /// Write the artifact and report success
    Succeed,
    /// Write the artifact and report these warnings
    Warn(Vec<String>),
    Transient,
    Validation(Vec<ReportedIssue>),
    Fatal,
    Panic,
    /// Report success without writing anything
    SucceedWithoutArtifact,
    /// Operator aborts the book mid-run, then the call fails transiently
    AbortThenTransient(StateStore),
    /// Operator aborts the book mid-run, then the call succeeds
    AbortThenSucceed(StateStore),
}

pub struct FakeStage {
    name: StageName,
    cost: f64,
    estimate: Option<f64>,
    delay: Option<Duration>,
    script: Mutex<VecDeque<Behavior>>,
    otherwise: Behavior,
    calls: AtomicU32,
}

impl FakeStage {
    pub fn new(name: StageName) -> Self {
        Self {
            name,
            cost: 0.0,
            estimate: None,
            delay: None,
            script: Mutex::new(VecDeque::new()),
            otherwise: Behavior::Succeed,
            calls: AtomicU32::new(0),
        }
    }

    /// Spend reported by every non-fatal call
    pub fn cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    /// Budget estimate; defaults to the reported cost
    pub fn estimate(mut self, estimate: f64) -> Self {
        self.estimate = Some(estimate);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue a behavior for the next unscripted call
    pub fn then(self, behavior: Behavior) -> Self {
        self.script.lock().unwrap().push_back(behavior);
        self
    }

    /// Queue a behavior on an already registered stage
    pub fn queue(&self, behavior: Behavior) {
        self.script.lock().unwrap().push_back(behavior);
    }

    /// Behavior once the script is used up
    pub fn otherwise(mut self, behavior: Behavior) -> Self {
        self.otherwise = behavior;
        self
    }

    pub fn stage_name(&self) -> StageName {
        self.name
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_behavior(&self) -> Behavior {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.otherwise.clone())
    }

    fn write_artifact(&self, ctx: &StageContext) {
        std::fs::create_dir_all(ctx.output.parent().unwrap()).unwrap();
        std::fs::write(&ctx.output, format!("{} output for {}", ctx.stage, ctx.book_id)).unwrap();
    }
}

#[async_trait::async_trait]
impl Stage for FakeStage {
    fn name(&self) -> StageName {
        self.name
    }

    fn estimated_cost(&self) -> f64 {
        self.estimate.unwrap_or(self.cost)
    }

    async fn run(&self, ctx: &StageContext) -> StageResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match self.next_behavior() {
            Behavior::Succeed => {
                self.write_artifact(ctx);
                StageResult::Success {
                    outputs: vec![ctx.output.clone()],
                    cost_usd: self.cost,
                }
            }
            Behavior::Warn(warnings) => {
                self.write_artifact(ctx);
                StageResult::SuccessWithWarnings {
                    outputs: vec![ctx.output.clone()],
                    warnings,
                    cost_usd: self.cost,
                }
            }
            Behavior::Transient => StageResult::TransientFailure {
                error: format!("connection reset (attempt {})", ctx.attempt),
                cost_usd: self.cost,
            },
            Behavior::Validation(issues) => StageResult::ValidationFailure {
                issues,
                cost_usd: self.cost,
            },
            Behavior::Fatal => StageResult::fatal("vendor rejected the request"),
            Behavior::Panic => panic!("stage exploded"),
            Behavior::SucceedWithoutArtifact => StageResult::success(self.cost),
            Behavior::AbortThenTransient(store) => {
                store.abort_book(&ctx.book_id, "operator stop").await.unwrap();
                StageResult::transient("connection reset")
            }
            Behavior::AbortThenSucceed(store) => {
                store.abort_book(&ctx.book_id, "operator stop").await.unwrap();
                self.write_artifact(ctx);
                StageResult::success(self.cost)
            }
        }
    }
}
