//! Task lifecycle tracking with bounded retry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::task::{TaskId, TaskRecord, TaskRuntime, TaskStatus};
use crate::state::store::{load_json, save_json, StateStore};
use crate::{Error, Result};

/// Store key of the persisted queue.
pub const QUEUE_KEY: &str = "task_queue";

/// Default number of attempts before a failure becomes terminal.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// A task record plus its lifecycle bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedTask {
    pub record: TaskRecord,
    #[serde(default)]
    pub runtime: TaskRuntime,
}

impl QueuedTask {
    pub fn status(&self) -> TaskStatus {
        self.record.status
    }
}

/// Per-status counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueProgress {
    pub total: usize,
    pub pending: usize,
    pub ready: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
    pub skipped: usize,
    /// completed / total * 100, 0 when empty.
    pub percent_complete: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct QueueState {
    tasks: Vec<QueuedTask>,
    execution_order: Vec<TaskId>,
    progress: QueueProgress,
    updated_at: DateTime<Utc>,
}

/// Owns the lifecycle status of every task.
pub struct TaskQueue {
    tasks: Vec<QueuedTask>,
    index: HashMap<TaskId, usize>,
    execution_order: Vec<TaskId>,
    max_retries: u32,
    store: Option<Arc<dyn StateStore>>,
}

impl TaskQueue {
    /// Create an in-memory queue.
    pub fn new(max_retries: u32) -> Self {
        Self {
            tasks: Vec::new(),
            index: HashMap::new(),
            execution_order: Vec::new(),
            max_retries,
            store: None,
        }
    }

    /// Create a queue that persists after every mutation.
    pub fn with_store(max_retries: u32, store: Arc<dyn StateStore>) -> Self {
        Self {
            store: Some(store),
            ..Self::new(max_retries)
        }
    }

    /// Start persisting to `store` and write the current state once.
    pub fn attach_store(&mut self, store: Arc<dyn StateStore>) -> Result<()> {
        self.store = Some(store);
        self.persist()
    }

    /// Restore the queue from the store.
    ///
    /// A missing record yields an empty queue. A corrupt record is logged
    /// and replaced by an empty queue.
    pub fn load(max_retries: u32, store: Arc<dyn StateStore>) -> Self {
        let mut queue = Self::with_store(max_retries, store.clone());
        match load_json::<QueueState>(store.as_ref(), QUEUE_KEY) {
            Ok(Some(state)) => {
                for (pos, task) in state.tasks.into_iter().enumerate() {
                    queue.index.insert(task.record.id.clone(), pos);
                    queue.tasks.push(task);
                }
                queue.execution_order = state.execution_order;
                debug!(tasks = queue.tasks.len(), "restored task queue");
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "task queue state unreadable, starting fresh");
            }
        }
        queue
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &TaskId) -> Option<&QueuedTask> {
        self.index.get(id).map(|&pos| &self.tasks[pos])
    }

    pub fn status(&self, id: &TaskId) -> Option<TaskStatus> {
        self.get(id).map(QueuedTask::status)
    }

    /// All tasks in insertion order.
    pub fn tasks(&self) -> &[QueuedTask] {
        &self.tasks
    }

    fn entry_mut(&mut self, id: &TaskId) -> Result<&mut QueuedTask> {
        match self.index.get(id) {
            Some(&pos) => Ok(&mut self.tasks[pos]),
            None => Err(Error::TaskNotFound(id.clone())),
        }
    }

    fn invalid(id: &TaskId, from: TaskStatus, to: TaskStatus) -> Error {
        Error::InvalidTransition {
            task: id.clone(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Enqueue a task. Tasks whose dependencies are all complete become
    /// ready immediately.
    ///
    /// # Errors
    /// Returns `Error::DuplicateTask` or a validation error; nothing is
    /// enqueued on failure.
    pub fn add_task(&mut self, record: TaskRecord) -> Result<()> {
        record.validate()?;
        if self.index.contains_key(&record.id) {
            return Err(Error::DuplicateTask(record.id));
        }

        let mut record = record;
        if !record.status.is_terminal() {
            record.status = TaskStatus::Pending;
        }
        debug!(task = %record.id, deps = record.dependencies.len(), "enqueued task");

        self.index.insert(record.id.clone(), self.tasks.len());
        self.tasks.push(QueuedTask {
            record,
            runtime: TaskRuntime::default(),
        });
        self.refresh_ready();
        self.persist()
    }

    /// Promote pending tasks whose dependencies are all completed.
    ///
    /// Returns the ids that became ready, in insertion order.
    pub fn refresh_ready(&mut self) -> Vec<TaskId> {
        self.promote(false)
    }

    /// Shared readiness pass. With `include_blocked`, blocked tasks whose
    /// dependencies are complete are released as well.
    fn promote(&mut self, include_blocked: bool) -> Vec<TaskId> {
        let completed = self.completed_ids();
        let mut promoted = Vec::new();

        for task in &mut self.tasks {
            let eligible = match task.record.status {
                TaskStatus::Pending => true,
                TaskStatus::Blocked => include_blocked,
                _ => false,
            };
            if !eligible {
                continue;
            }
            if task
                .record
                .dependencies
                .iter()
                .all(|dep| completed.contains(dep))
            {
                if task.record.status == TaskStatus::Blocked {
                    task.runtime.block_reason = None;
                    debug!(task = %task.record.id, "blocked task released");
                }
                task.record.status = TaskStatus::Ready;
                promoted.push(task.record.id.clone());
            }
        }

        for id in &promoted {
            if !self.execution_order.contains(id) {
                self.execution_order.push(id.clone());
            }
        }
        if !promoted.is_empty() {
            debug!(count = promoted.len(), "tasks became ready");
        }
        promoted
    }

    /// Hand a ready task to an execution actor.
    pub fn start_task(&mut self, id: &TaskId) -> Result<()> {
        let task = self.entry_mut(id)?;
        if task.record.status != TaskStatus::Ready {
            return Err(Self::invalid(id, task.record.status, TaskStatus::InProgress));
        }
        task.record.status = TaskStatus::InProgress;
        task.runtime.started_at = Some(Utc::now());
        debug!(task = %id, "task started");
        self.persist()
    }

    /// Mark an in-progress task completed and promote its dependents.
    ///
    /// The refresh covers pending and blocked tasks, so a blocked task whose
    /// last dependency just completed becomes ready here.
    pub fn complete_task(&mut self, id: &TaskId) -> Result<Vec<TaskId>> {
        let task = self.entry_mut(id)?;
        if task.record.status != TaskStatus::InProgress {
            return Err(Self::invalid(id, task.record.status, TaskStatus::Completed));
        }
        task.record.status = TaskStatus::Completed;
        task.runtime.completed_at = Some(Utc::now());
        task.runtime.error = None;
        info!(task = %id, "task completed");

        let promoted = self.promote(true);
        self.persist()?;
        Ok(promoted)
    }

    /// Record a failure. While retries remain the task goes back to
    /// `Pending` and through the readiness refresh, so the result is `Ready`
    /// only when its dependencies are complete. Exhausted retries give
    /// `Failed`.
    pub fn fail_task(&mut self, id: &TaskId, error: &str) -> Result<TaskStatus> {
        let max_retries = self.max_retries;
        let task = self.entry_mut(id)?;
        if task.record.status.is_terminal() {
            return Err(Self::invalid(id, task.record.status, TaskStatus::Failed));
        }

        task.runtime.retry_count += 1;
        task.runtime.error = Some(error.to_string());
        task.runtime.started_at = None;
        task.runtime.block_reason = None;
        if task.runtime.retry_count < max_retries {
            task.record.status = TaskStatus::Pending;
            warn!(
                task = %id,
                attempt = task.runtime.retry_count,
                max_retries,
                error,
                "task failed, will retry"
            );
        } else {
            task.record.status = TaskStatus::Failed;
            warn!(task = %id, attempts = task.runtime.retry_count, error, "task failed permanently");
        }
        self.refresh_ready();
        self.persist()?;
        self.status(id).ok_or_else(|| Error::TaskNotFound(id.clone()))
    }

    /// Skip a task. Terminal.
    pub fn skip_task(&mut self, id: &TaskId, reason: &str) -> Result<()> {
        let task = self.entry_mut(id)?;
        if task.record.status.is_terminal() {
            return Err(Self::invalid(id, task.record.status, TaskStatus::Skipped));
        }
        task.record.status = TaskStatus::Skipped;
        task.runtime.skip_reason = Some(reason.to_string());
        info!(task = %id, reason, "task skipped");
        self.persist()
    }

    /// Park a non-terminal task. It leaves the blocked state through
    /// `unblock_task`, or when a `complete_task` refresh finds its
    /// dependencies complete.
    pub fn block_task(&mut self, id: &TaskId, reason: &str) -> Result<()> {
        let task = self.entry_mut(id)?;
        if task.record.status.is_terminal() {
            return Err(Self::invalid(id, task.record.status, TaskStatus::Blocked));
        }
        task.record.status = TaskStatus::Blocked;
        task.runtime.block_reason = Some(reason.to_string());
        task.runtime.started_at = None;
        info!(task = %id, reason, "task blocked");
        self.persist()
    }

    /// Release a blocked task; it is ready again once its dependencies are.
    pub fn unblock_task(&mut self, id: &TaskId) -> Result<TaskStatus> {
        let task = self.entry_mut(id)?;
        if task.record.status != TaskStatus::Blocked {
            return Err(Self::invalid(id, task.record.status, TaskStatus::Pending));
        }
        task.record.status = TaskStatus::Pending;
        task.runtime.block_reason = None;
        self.refresh_ready();
        self.persist()?;
        self.status(id).ok_or_else(|| Error::TaskNotFound(id.clone()))
    }

    /// Roll lifecycle state back to a set of completed tasks.
    ///
    /// Every task outside `completed` that is not skipped returns to pending
    /// with fresh bookkeeping, then readiness is recomputed.
    pub fn restore_completed(&mut self, completed: &HashSet<TaskId>) -> Result<()> {
        let mut reset = 0;
        for task in &mut self.tasks {
            if completed.contains(&task.record.id) {
                task.record.status = TaskStatus::Completed;
                continue;
            }
            if task.record.status == TaskStatus::Skipped {
                continue;
            }
            if task.record.status != TaskStatus::Pending {
                reset += 1;
            }
            task.record.status = TaskStatus::Pending;
            task.runtime = TaskRuntime::default();
        }

        self.execution_order.retain(|id| completed.contains(id));
        self.refresh_ready();
        info!(kept = completed.len(), reset, "restored task queue from checkpoint");
        self.persist()
    }

    /// Tasks with the given status, in insertion order.
    pub fn tasks_with_status(&self, status: TaskStatus) -> Vec<&TaskRecord> {
        self.tasks
            .iter()
            .filter(|t| t.record.status == status)
            .map(|t| &t.record)
            .collect()
    }

    pub fn ready_tasks(&self) -> Vec<&TaskRecord> {
        self.tasks_with_status(TaskStatus::Ready)
    }

    /// Order in which tasks became ready.
    pub fn execution_order(&self) -> &[TaskId] {
        &self.execution_order
    }

    pub fn completed_ids(&self) -> HashSet<TaskId> {
        self.tasks
            .iter()
            .filter(|t| t.record.status == TaskStatus::Completed)
            .map(|t| t.record.id.clone())
            .collect()
    }

    /// Completed ids in insertion order.
    pub fn completed_list(&self) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|t| t.record.status == TaskStatus::Completed)
            .map(|t| t.record.id.clone())
            .collect()
    }

    /// Whether every task has reached a terminal status.
    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(|t| t.record.status.is_terminal())
    }

    pub fn progress(&self) -> QueueProgress {
        let mut progress = QueueProgress {
            total: self.tasks.len(),
            ..Default::default()
        };
        for task in &self.tasks {
            match task.record.status {
                TaskStatus::Pending => progress.pending += 1,
                TaskStatus::Ready => progress.ready += 1,
                TaskStatus::InProgress => progress.in_progress += 1,
                TaskStatus::Completed => progress.completed += 1,
                TaskStatus::Failed => progress.failed += 1,
                TaskStatus::Blocked => progress.blocked += 1,
                TaskStatus::Skipped => progress.skipped += 1,
            }
        }
        if progress.total > 0 {
            progress.percent_complete = progress.completed as f64 / progress.total as f64 * 100.0;
        }
        progress
    }

    fn persist(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let state = QueueState {
            tasks: self.tasks.clone(),
            execution_order: self.execution_order.clone(),
            progress: self.progress(),
            updated_at: Utc::now(),
        };
        save_json(store.as_ref(), QUEUE_KEY, &state)
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("tasks", &self.tasks.len())
            .field("max_retries", &self.max_retries)
            .field("persistent", &self.store.is_some())
            .finish()
    }
}
