use thiserror::Error;

use crate::core::task::TaskId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Duplicate task id: {0}")]
    DuplicateTask(TaskId),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Missing dependencies: {}", format_missing(.0))]
    MissingDependencies(Vec<(TaskId, TaskId)>),

    #[error("Circular dependency detected: {}", format_cycle(.cycle))]
    CircularDependency { cycle: Vec<TaskId> },

    #[error("Invalid transition for task {task}: {from} -> {to}")]
    InvalidTransition {
        task: TaskId,
        from: String,
        to: String,
    },

    #[error("Cannot start phase {phase}: active blockers [{}]", .blockers.join(", "))]
    PhaseBlocked { phase: String, blockers: Vec<String> },

    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("No checkpoints recorded")]
    NoCheckpoints,

    #[error("State store error: {0}")]
    Store(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

fn format_missing(pairs: &[(TaskId, TaskId)]) -> String {
    pairs
        .iter()
        .map(|(task, dep)| format!("{} -> {}", task, dep))
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_cycle(cycle: &[TaskId]) -> String {
    cycle
        .iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

pub type Result<T> = std::result::Result<T, Error>;
