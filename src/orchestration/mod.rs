//! Orchestration layer for forgeplan.
//!
//! This module groups tasks into batches, runs ready tasks concurrently,
//! and drives the eight-phase build loop over the planning components.

pub mod batch;
pub mod dispatch;
pub mod orchestrator;

pub use batch::{
    batch_complexity, summarize, BatchOptimizer, BatchPlanSummary, BatchPolicy, BatchViolation,
    ComplexityCaps, ComplexityPolicy, TaskBatch,
};
pub use dispatch::{DispatchEvent, DispatchReport, LevelDispatcher, TaskOutcome};
pub use orchestrator::{
    handler_fn, BatchCreationHandler, DependencyAnalysis, DependencyAnalysisHandler, FnHandler,
    Orchestrator, PhaseContext, PhaseHandler, PhaseOutcome, RunOutcome, RunReport,
};
