//! forgeplan: dependency-aware build planning.
//!
//! Tasks form a dependency graph that yields execution levels and a
//! critical path. A persistent queue tracks each task's lifecycle, batches
//! group compatible ready work, and an orchestrator drives eight build
//! phases with blockers and rollback-capable checkpoints.

pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod state;
pub mod workflow;

pub use error::{Error, Result};
