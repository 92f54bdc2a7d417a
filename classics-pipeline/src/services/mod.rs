//! Narrow views over the state store
//!
//! - `IssueTracker`: append-only issue ledger with one-way resolution
//! - `CostLedger`: monotonic per-book spend with a prospective budget check
//! - `ApprovalGate`: human checkpoint before paid generation

pub mod approval_gate;
pub mod cost_ledger;
pub mod issue_tracker;

pub use approval_gate::ApprovalGate;
pub use cost_ledger::CostLedger;
pub use issue_tracker::IssueTracker;
