//! Level dispatcher for concurrent task execution.
//!
//! The dispatcher pulls ready tasks from the queue, runs up to
//! `max_parallel` of them at once through a caller-supplied runner, and
//! records each outcome in the queue before looking for newly ready work.
//! The queue persists inside `complete_task`, so a dependent is never
//! dispatched before its dependencies' completion is durable.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::core::queue::TaskQueue;
use crate::core::task::{TaskId, TaskRecord, TaskStatus};
use crate::{Error, Result};

/// What a task runner reports back.
pub type TaskOutcome = std::result::Result<(), String>;

/// Events emitted as tasks move through the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchEvent {
    TaskStarted {
        task_id: TaskId,
    },
    TaskCompleted {
        task_id: TaskId,
    },
    TaskFailed {
        task_id: TaskId,
        error: String,
        /// Whether the queue put the task back to ready.
        will_retry: bool,
    },
    /// Nothing is ready or running anymore.
    Idle,
}

/// Summary of a dispatch run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReport {
    /// Completed tasks in completion order.
    pub completed: Vec<TaskId>,
    /// Tasks that exhausted their retries.
    pub failed: Vec<TaskId>,
    /// Failed attempts that were retried.
    pub retries: usize,
    /// Ready tasks held back by interruption gates.
    pub gated: Vec<TaskId>,
}

/// Runs ready tasks concurrently.
pub struct LevelDispatcher {
    max_parallel: usize,
    gates: HashSet<TaskId>,
    event_tx: Option<mpsc::Sender<DispatchEvent>>,
}

impl LevelDispatcher {
    pub fn new(max_parallel: usize) -> Self {
        Self {
            max_parallel: max_parallel.max(1),
            gates: HashSet::new(),
            event_tx: None,
        }
    }

    /// Tasks that must never be dispatched automatically.
    pub fn with_gates(mut self, gates: impl IntoIterator<Item = TaskId>) -> Self {
        self.gates = gates.into_iter().collect();
        self
    }

    pub fn with_events(mut self, event_tx: mpsc::Sender<DispatchEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    async fn emit(&self, event: DispatchEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event).await;
        }
    }

    /// Drive the queue until nothing is ready or running.
    ///
    /// Runner errors count as task failures and go through the queue's retry
    /// policy. A panicking runner is treated the same way.
    pub async fn run<F, Fut>(
        &self,
        queue: Arc<RwLock<TaskQueue>>,
        runner: F,
    ) -> Result<DispatchReport>
    where
        F: Fn(TaskRecord) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskOutcome> + Send + 'static,
    {
        let mut report = DispatchReport::default();
        let mut running: JoinSet<(TaskId, TaskOutcome)> = JoinSet::new();

        loop {
            let started = self.fill(&queue, &runner, &mut running).await?;
            for task_id in started {
                self.emit(DispatchEvent::TaskStarted { task_id }).await;
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            let (task_id, outcome) = joined.map_err(|e| Error::TaskJoin(e.to_string()))?;

            match outcome {
                Ok(()) => {
                    queue.write().await.complete_task(&task_id)?;
                    report.completed.push(task_id.clone());
                    self.emit(DispatchEvent::TaskCompleted { task_id }).await;
                }
                Err(error) => {
                    let status = queue.write().await.fail_task(&task_id, &error)?;
                    let will_retry = status != TaskStatus::Failed;
                    if will_retry {
                        report.retries += 1;
                    } else {
                        report.failed.push(task_id.clone());
                    }
                    self.emit(DispatchEvent::TaskFailed {
                        task_id,
                        error,
                        will_retry,
                    })
                    .await;
                }
            }
        }

        report.gated = queue
            .read()
            .await
            .ready_tasks()
            .into_iter()
            .filter(|t| self.gates.contains(&t.id))
            .map(|t| t.id.clone())
            .collect();

        info!(
            completed = report.completed.len(),
            failed = report.failed.len(),
            retries = report.retries,
            gated = report.gated.len(),
            "dispatch finished"
        );
        self.emit(DispatchEvent::Idle).await;
        Ok(report)
    }

    /// Start ready tasks until the pool is full. Returns the started ids.
    async fn fill<F, Fut>(
        &self,
        queue: &Arc<RwLock<TaskQueue>>,
        runner: &F,
        running: &mut JoinSet<(TaskId, TaskOutcome)>,
    ) -> Result<Vec<TaskId>>
    where
        F: Fn(TaskRecord) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskOutcome> + Send + 'static,
    {
        let mut queue = queue.write().await;
        let candidates: Vec<TaskRecord> = queue
            .ready_tasks()
            .into_iter()
            .filter(|t| !self.gates.contains(&t.id))
            .cloned()
            .collect();

        let mut started = Vec::new();
        for record in candidates {
            if running.len() >= self.max_parallel {
                break;
            }
            queue.start_task(&record.id)?;

            let task_id = record.id.clone();
            debug!(task = %task_id, running = running.len() + 1, "dispatching task");
            started.push(task_id.clone());

            // The inner spawn turns a runner panic into a JoinError we can
            // attribute to the task.
            let work = tokio::spawn(runner(record));
            running.spawn(async move {
                let outcome = match work.await {
                    Ok(result) => result,
                    Err(e) if e.is_panic() => Err("task runner panicked".to_string()),
                    Err(e) => Err(format!("task runner cancelled: {}", e)),
                };
                (task_id, outcome)
            });
        }
        Ok(started)
    }
}

impl std::fmt::Debug for LevelDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LevelDispatcher")
            .field("max_parallel", &self.max_parallel)
            .field("gates", &self.gates.len())
            .finish()
    }
}
