//! Parallel execution correctness tests.
//!
//! These tests run a loaded plan through the level dispatcher and check
//! that dependencies are honored while independent tasks overlap.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};

use forgeplan::config::Config;
use forgeplan::core::queue::TaskQueue;
use forgeplan::core::task::{Complexity, TaskId, TaskStatus};
use forgeplan::orchestration::{DispatchEvent, LevelDispatcher};

use crate::fixtures::{diamond_tasks, task, TestState};

/// Test: Diamond dispatch
/// Given root -> {left, right} -> join
/// When dispatched with two workers
/// Then join starts only after both branches finished
#[tokio::test]
async fn test_diamond_respects_dependencies() {
    let state = TestState::new();
    let mut orch = state.open(&Config::default());
    orch.load_tasks(diamond_tasks()).unwrap();
    drop(orch);

    let queue = Arc::new(RwLock::new(TaskQueue::load(3, state.store())));
    let finished: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let log = finished.clone();

    let report = LevelDispatcher::new(2)
        .run(queue.clone(), move |record| {
            let log = log.clone();
            async move {
                if record.id.as_str() == "join" {
                    let done = log.lock().unwrap().clone();
                    if !(done.contains(&"left".to_string()) && done.contains(&"right".to_string())) {
                        return Err("join started early".to_string());
                    }
                }
                tokio::time::sleep(Duration::from_millis(u64::from(record.duration_minutes))).await;
                log.lock().unwrap().push(record.id.to_string());
                Ok(())
            }
        })
        .await
        .unwrap();

    assert_eq!(report.completed.len(), 4);
    assert!(report.failed.is_empty());
    assert_eq!(report.retries, 0);
    assert_eq!(report.completed.last(), Some(&TaskId::from("join")));

    // Completion was persisted before each dependent was dispatched.
    let reloaded = TaskQueue::load(3, state.store());
    assert!(reloaded.is_finished());
    assert_eq!(reloaded.progress().completed, 4);
}

/// Test: Failure isolation
/// Given a failing branch
/// When dispatched
/// Then the healthy branch completes and dependents of the failure wait
#[tokio::test]
async fn test_failure_isolates_dependents() {
    let mut queue = TaskQueue::new(2);
    for record in diamond_tasks() {
        queue.add_task(record).unwrap();
    }
    queue
        .add_task(task("docs", "documentation", Complexity::Simple, 5, &["right"]))
        .unwrap();
    let queue = Arc::new(RwLock::new(queue));
    let (tx, mut rx) = mpsc::channel(64);

    let report = LevelDispatcher::new(4)
        .with_events(tx)
        .run(queue.clone(), |record| async move {
            if record.id.as_str() == "left" {
                Err("compile error".to_string())
            } else {
                Ok(())
            }
        })
        .await
        .unwrap();

    assert_eq!(report.failed, vec![TaskId::from("left")]);
    assert_eq!(report.retries, 1);

    let queue = queue.read().await;
    assert_eq!(queue.status(&TaskId::from("right")), Some(TaskStatus::Completed));
    assert_eq!(queue.status(&TaskId::from("docs")), Some(TaskStatus::Completed));
    assert_eq!(queue.status(&TaskId::from("join")), Some(TaskStatus::Pending));

    let mut retried = false;
    while let Ok(event) = rx.try_recv() {
        if let DispatchEvent::TaskFailed {
            task_id,
            will_retry: true,
            ..
        } = event
        {
            assert_eq!(task_id, TaskId::from("left"));
            retried = true;
        }
    }
    assert!(retried);
}
