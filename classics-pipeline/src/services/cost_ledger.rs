//! Cost ledger
//!
//! Spend per book only ever grows. The budget check is prospective: it runs
//! before a paid stage is invoked, so a rejected operation spends nothing.

use tracing::{debug, warn};

use crate::db::StateStore;
use crate::error::{PipelineError, PipelineResult};

#[derive(Clone)]
pub struct CostLedger {
    store: StateStore,
    ceiling_usd: f64,
}

impl CostLedger {
    pub fn new(store: StateStore, ceiling_usd: f64) -> Self {
        Self { store, ceiling_usd }
    }

    pub fn ceiling(&self) -> f64 {
        self.ceiling_usd
    }

    /// Fail with `BudgetExceeded` if `current + estimated > ceiling`
    pub async fn check_budget(&self, book_id: &str, estimated_delta: f64) -> PipelineResult<()> {
        if !estimated_delta.is_finite() || estimated_delta < 0.0 {
            return Err(PipelineError::Validation(format!(
                "estimated cost must be a non-negative amount, got {}",
                estimated_delta
            )));
        }

        let book = self.store.get_book(book_id).await?;
        if book.cost_usd + estimated_delta > self.ceiling_usd {
            warn!(
                book_id,
                current = book.cost_usd,
                estimated = estimated_delta,
                ceiling = self.ceiling_usd,
                "Budget check rejected"
            );
            return Err(PipelineError::BudgetExceeded {
                book_id: book_id.to_string(),
                current: book.cost_usd,
                estimated: estimated_delta,
                ceiling: self.ceiling_usd,
            });
        }

        debug!(book_id, current = book.cost_usd, estimated = estimated_delta, "Budget check passed");
        Ok(())
    }

    /// Add spend to a book; negative or non-finite deltas are rejected
    pub async fn record_cost(&self, book_id: &str, delta: f64) -> PipelineResult<f64> {
        let total = self.store.add_cost(book_id, delta).await?;
        debug!(book_id, delta, total, "Recorded cost");
        Ok(total)
    }

    /// Spend across every book, archived ones included
    pub async fn total_spend(&self) -> PipelineResult<f64> {
        self.store.total_cost().await
    }

    /// Headroom left under the ceiling for one book
    pub async fn remaining_budget(&self, book_id: &str) -> PipelineResult<f64> {
        let book = self.store.get_book(book_id).await?;
        Ok((self.ceiling_usd - book.cost_usd).max(0.0))
    }
}
