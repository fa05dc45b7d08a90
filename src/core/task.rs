//! Task record model consumed by the planning core.
//!
//! Task records arrive from upstream decomposition as JSON. Each record
//! carries its identity, domain and complexity tags, a duration estimate,
//! and the ids of the tasks it depends on.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;

use crate::error::{Error, Result};

/// Allowed shape of a task identifier.
static TASK_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:-]*$").unwrap());

/// Identifier of a task, as assigned by upstream decomposition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Complexity tag of a task, ordered by severity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    #[default]
    Simple,
    Medium,
    Complex,
    Critical,
}

impl Complexity {
    /// Numeric severity rank (simple = 0 .. critical = 3).
    pub fn severity(self) -> u8 {
        match self {
            Complexity::Simple => 0,
            Complexity::Medium => 1,
            Complexity::Complex => 2,
            Complexity::Critical => 3,
        }
    }

    /// Whether two complexities are at most one severity step apart.
    pub fn is_adjacent(self, other: Complexity) -> bool {
        self.severity().abs_diff(other.severity()) <= 1
    }
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Complexity::Simple => write!(f, "simple"),
            Complexity::Medium => write!(f, "medium"),
            Complexity::Complex => write!(f, "complex"),
            Complexity::Critical => write!(f, "critical"),
        }
    }
}

/// Task status in its lifecycle.
///
/// pending -> ready -> in_progress -> {completed | failed | blocked | skipped}.
/// A failed task that still has retries left goes back to ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for dependencies.
    #[default]
    Pending,
    /// Every dependency is completed.
    Ready,
    /// Handed to an execution actor.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Retries exhausted.
    Failed,
    /// Parked until an external condition clears.
    Blocked,
    /// Deliberately not executed.
    Skipped,
}

impl TaskStatus {
    /// Statuses a task never leaves on its own.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        )
    }

    pub const ALL: [TaskStatus; 7] = [
        TaskStatus::Pending,
        TaskStatus::Ready,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Blocked,
        TaskStatus::Skipped,
    ];
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Ready => write!(f, "ready"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Blocked => write!(f, "blocked"),
            TaskStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// A single implementation task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Unique identifier.
    pub id: TaskId,
    /// Short human-readable name.
    pub name: String,
    /// What the task should accomplish.
    pub description: String,
    /// Domain tag such as `backend` or `testing`.
    pub domain: String,
    /// Complexity tag. Required; there is no implied level.
    pub complexity: Complexity,
    /// Estimated duration in minutes.
    pub duration_minutes: u32,
    /// Ids of tasks that must complete first, in declaration order.
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    /// Ordered acceptance criteria.
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Lifecycle status as supplied upstream.
    #[serde(default)]
    pub status: TaskStatus,
}

impl TaskRecord {
    /// Create a pending task with no dependencies.
    pub fn new(
        id: impl Into<TaskId>,
        name: &str,
        domain: &str,
        complexity: Complexity,
        duration_minutes: u32,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.to_string(),
            description: String::new(),
            domain: domain.to_string(),
            complexity,
            duration_minutes,
            dependencies: Vec::new(),
            acceptance_criteria: Vec::new(),
            status: TaskStatus::Pending,
        }
    }

    /// Builder-style dependency declaration.
    pub fn depends_on<I, T>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        for dep in deps {
            let dep = dep.into();
            if !self.dependencies.contains(&dep) {
                self.dependencies.push(dep);
            }
        }
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_criteria(mut self, criteria: &[&str]) -> Self {
        self.acceptance_criteria = criteria.iter().map(|c| c.to_string()).collect();
        self
    }

    /// Check the record-level invariants.
    pub fn validate(&self) -> Result<()> {
        if !TASK_ID_RE.is_match(self.id.as_str()) {
            return Err(Error::Validation(format!(
                "Invalid task id {:?}",
                self.id.as_str()
            )));
        }
        if self.name.trim().is_empty() {
            return Err(Error::Validation(format!(
                "Task {} has an empty name",
                self.id
            )));
        }
        if self.domain.trim().is_empty() {
            return Err(Error::Validation(format!(
                "Task {} has an empty domain",
                self.id
            )));
        }
        if self.duration_minutes == 0 {
            return Err(Error::Validation(format!(
                "Task {} must have a positive duration estimate",
                self.id
            )));
        }
        if self.dependencies.contains(&self.id) {
            return Err(Error::CircularDependency {
                cycle: vec![self.id.clone(), self.id.clone()],
            });
        }
        Ok(())
    }
}

/// Lifecycle bookkeeping kept by the task queue alongside each record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskRuntime {
    pub retry_count: u32,
    pub error: Option<String>,
    pub skip_reason: Option<String>,
    pub block_reason: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Validate a batch of records as a unit: every record individually,
/// then id uniqueness. Nothing is committed by the caller on failure.
pub fn validate_records(records: &[TaskRecord]) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for record in records {
        record.validate()?;
        if !seen.insert(&record.id) {
            return Err(Error::DuplicateTask(record.id.clone()));
        }
    }
    Ok(())
}

/// Read task records from a JSON array file.
pub fn load_records(path: &Path) -> Result<Vec<TaskRecord>> {
    let contents = std::fs::read_to_string(path)?;
    let records: Vec<TaskRecord> = serde_json::from_str(&contents)?;
    validate_records(&records)?;
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_display() {
        let id = TaskId::from("auth-1");
        assert_eq!(format!("{}", id), "auth-1");
        assert_eq!(id.as_str(), "auth-1");
    }

    #[test]
    fn test_task_id_serialization_is_transparent() {
        let id = TaskId::from("T1");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""T1""#);
    }

    #[test]
    fn test_complexity_ordering() {
        assert!(Complexity::Simple < Complexity::Medium);
        assert!(Complexity::Medium < Complexity::Complex);
        assert!(Complexity::Complex < Complexity::Critical);
    }

    #[test]
    fn test_complexity_adjacency() {
        assert!(Complexity::Simple.is_adjacent(Complexity::Medium));
        assert!(Complexity::Complex.is_adjacent(Complexity::Critical));
        assert!(Complexity::Medium.is_adjacent(Complexity::Medium));
        assert!(!Complexity::Simple.is_adjacent(Complexity::Complex));
        assert!(!Complexity::Critical.is_adjacent(Complexity::Medium));
    }

    #[test]
    fn test_task_status_default() {
        assert_eq!(TaskStatus::default(), TaskStatus::Pending);
    }

    #[test]
    fn test_task_status_terminal() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Skipped.is_terminal());
        assert!(!TaskStatus::Blocked.is_terminal());
        assert!(!TaskStatus::Ready.is_terminal());
    }

    #[test]
    fn test_task_status_serialization_format() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::InProgress).unwrap(),
            r#""in_progress""#
        );
    }

    #[test]
    fn test_record_deserialize_with_defaults() {
        let json = r#"{
            "id": "B",
            "name": "Build API",
            "description": "REST endpoints",
            "domain": "backend",
            "complexity": "medium",
            "duration_minutes": 90,
            "dependencies": ["A"]
        }"#;
        let record: TaskRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.id, TaskId::from("B"));
        assert_eq!(record.complexity, Complexity::Medium);
        assert_eq!(record.dependencies, vec![TaskId::from("A")]);
        assert!(record.acceptance_criteria.is_empty());
        assert_eq!(record.status, TaskStatus::Pending);
    }

    #[test]
    fn test_depends_on_dedupes() {
        let record = TaskRecord::new("C", "c", "backend", Complexity::Simple, 10)
            .depends_on(["A", "B", "A"]);
        assert_eq!(record.dependencies.len(), 2);
    }

    #[test]
    fn test_validate_rejects_zero_duration() {
        let record = TaskRecord::new("A", "a", "backend", Complexity::Simple, 0);
        let err = record.validate().unwrap_err();
        assert!(err.to_string().contains("positive duration"));
    }

    #[test]
    fn test_validate_rejects_bad_id() {
        let record = TaskRecord::new("has space", "a", "backend", Complexity::Simple, 5);
        assert!(matches!(record.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_validate_rejects_empty_name() {
        let record = TaskRecord::new("A", "  ", "backend", Complexity::Simple, 5);
        assert!(record.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_self_dependency() {
        let record =
            TaskRecord::new("A", "a", "backend", Complexity::Simple, 5).depends_on(["A"]);
        assert!(matches!(
            record.validate(),
            Err(Error::CircularDependency { .. })
        ));
    }

    #[test]
    fn test_validate_records_duplicate() {
        let records = vec![
            TaskRecord::new("A", "a", "backend", Complexity::Simple, 5),
            TaskRecord::new("A", "again", "backend", Complexity::Simple, 5),
        ];
        assert!(matches!(
            validate_records(&records),
            Err(Error::DuplicateTask(id)) if id.as_str() == "A"
        ));
    }

    #[test]
    fn test_load_records_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tasks.json");
        std::fs::write(
            &path,
            r#"[{"id":"A","name":"a","description":"","domain":"backend","complexity":"complex","duration_minutes":30}]"#,
        )
        .unwrap();

        let records = load_records(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].complexity, Complexity::Complex);
    }

    #[test]
    fn test_load_records_requires_complexity() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tasks.json");
        std::fs::write(
            &path,
            r#"[{"id":"A","name":"a","description":"","domain":"backend","duration_minutes":30}]"#,
        )
        .unwrap();

        let err = load_records(&path).unwrap_err();
        assert!(err.to_string().contains("complexity"), "{err}");
    }
}
