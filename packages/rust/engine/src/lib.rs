//! Tiered decomposition and convergence engine.
//!
//! Expands a root product into a bill-of-materials tree one tier at a time:
//! elicit child components from the oracle, deduplicate near-simultaneous
//! siblings, fan out enrichment over every survivor, poll the tier to
//! convergence, then recurse into non-terminal children.

pub mod controller;
pub mod dedup;
pub mod elicitor;
pub mod enrichment;
pub mod poller;

pub use controller::{Engine, ExpandReport, TierOutcome};
pub use dedup::{MergePlan, plan_merges};
pub use enrichment::BatchOutcome;
pub use poller::Convergence;

// ---------------------------------------------------------------------------
// Progress trait
// ---------------------------------------------------------------------------

/// Progress callback for long-running engine operations.
pub trait EngineProgress: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Task-level progress within the current phase.
    fn task_progress(&self, current: usize, total: usize, detail: &str);
}

/// No-op progress reporter.
pub struct SilentProgress;

impl EngineProgress for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn task_progress(&self, _current: usize, _total: usize, _detail: &str) {}
}
