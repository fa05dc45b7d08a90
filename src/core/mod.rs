//! Core planning models.
//!
//! This module contains the task record model, the dependency graph built
//! from it, and the queue that tracks each task's lifecycle.

pub mod dag;
pub mod queue;
pub mod task;

pub use dag::{CriticalPath, DependencyGraph, ExecutionLevel, MissingDependency};
pub use queue::{QueueProgress, QueuedTask, TaskQueue};
pub use task::{Complexity, TaskId, TaskRecord, TaskRuntime, TaskStatus};
