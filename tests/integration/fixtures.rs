//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Predefined task sets
//! - Temporary state directories backed by `FileStore`

use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

use forgeplan::config::Config;
use forgeplan::core::task::{Complexity, TaskRecord};
use forgeplan::orchestration::Orchestrator;
use forgeplan::state::{FileStore, StateStore};

/// Build a task record with the given dependencies.
pub fn task(id: &str, domain: &str, complexity: Complexity, minutes: u32, deps: &[&str]) -> TaskRecord {
    TaskRecord::new(id, &format!("Task {}", id), domain, complexity, minutes)
        .depends_on(deps.iter().copied())
}

/// A(backend) -> B(backend, complex), A -> C(frontend).
pub fn abc_tasks() -> Vec<TaskRecord> {
    vec![
        task("A", "backend", Complexity::Simple, 60, &[]),
        task("B", "backend", Complexity::Complex, 90, &["A"]),
        task("C", "frontend", Complexity::Simple, 30, &["A"]),
    ]
}

/// A(60) -> B(90) -> C(120).
pub fn chain_tasks() -> Vec<TaskRecord> {
    vec![
        task("A", "backend", Complexity::Simple, 60, &[]),
        task("B", "backend", Complexity::Simple, 90, &["A"]),
        task("C", "backend", Complexity::Simple, 120, &["B"]),
    ]
}

/// root -> {left, right} -> join.
pub fn diamond_tasks() -> Vec<TaskRecord> {
    vec![
        task("root", "backend", Complexity::Simple, 10, &[]),
        task("left", "backend", Complexity::Simple, 20, &["root"]),
        task("right", "frontend", Complexity::Simple, 30, &["root"]),
        task("join", "testing", Complexity::Medium, 15, &["left", "right"]),
    ]
}

/// A temporary state directory that can be reopened like a new process.
pub struct TestState {
    /// Keeps the directory alive for the test's duration.
    pub temp_dir: TempDir,
    pub path: PathBuf,
}

impl TestState {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join(".forgeplan");
        Self { temp_dir, path }
    }

    pub fn store(&self) -> Arc<dyn StateStore> {
        Arc::new(FileStore::new(&self.path))
    }

    /// Open an orchestrator over this directory with a fresh store handle.
    pub fn open(&self, config: &Config) -> Orchestrator {
        Orchestrator::open(config, self.store()).expect("Failed to open orchestrator")
    }
}
