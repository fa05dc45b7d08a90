//! Performance tests for forgeplan.
//!
//! These tests verify that planning stays cheap on large graphs:
//! - Graph construction and cycle check for 2,000 tasks
//! - Level and critical path computation for the same graph
//! - Batching 500 ready tasks
//!
//! Use `cargo test --test integration performance -- --nocapture` to see metrics.

use std::time::{Duration, Instant};

use forgeplan::core::dag::DependencyGraph;
use forgeplan::core::task::{Complexity, TaskRecord};
use forgeplan::orchestration::{BatchOptimizer, BatchPolicy};

const MAX_PLANNING_TIME: Duration = Duration::from_secs(2);

/// Layered graph: each task depends on up to three tasks of the previous layer.
fn layered_tasks(layers: usize, width: usize) -> Vec<TaskRecord> {
    let mut tasks = Vec::with_capacity(layers * width);
    for layer in 0..layers {
        for slot in 0..width {
            let id = format!("L{}-{}", layer, slot);
            let mut record = TaskRecord::new(
                id.as_str(),
                &id,
                ["backend", "frontend", "testing"][slot % 3],
                Complexity::Simple,
                (slot % 7 + 1) as u32 * 10,
            );
            if layer > 0 {
                record = record.depends_on(
                    (0..3).map(|k| format!("L{}-{}", layer - 1, (slot + k) % width)),
                );
            }
            tasks.push(record);
        }
    }
    tasks
}

#[test]
fn test_large_graph_planning_time() {
    let tasks = layered_tasks(40, 50);

    let start = Instant::now();
    let mut graph = DependencyGraph::new();
    graph.build_graph(&tasks).unwrap();
    let levels = graph.get_execution_levels().unwrap();
    let path = graph.get_critical_path().unwrap();
    let order = graph.topological_sort().unwrap();
    let elapsed = start.elapsed();

    println!("planned {} tasks in {:?}", tasks.len(), elapsed);
    assert_eq!(levels.len(), 40);
    assert_eq!(order.len(), 2_000);
    assert_eq!(path.tasks.len(), 40);
    assert!(
        elapsed < MAX_PLANNING_TIME,
        "planning took {:?}, limit {:?}",
        elapsed,
        MAX_PLANNING_TIME
    );
}

#[test]
fn test_batching_many_ready_tasks() {
    let tasks = layered_tasks(1, 500);
    let mut optimizer = BatchOptimizer::new(BatchPolicy::default());

    let start = Instant::now();
    let batches = optimizer.create_batches(&tasks);
    let elapsed = start.elapsed();

    println!("batched {} tasks into {} batches in {:?}", tasks.len(), batches.len(), elapsed);
    assert_eq!(batches.iter().map(|b| b.len()).sum::<usize>(), 500);
    assert!(batches.iter().all(|b| optimizer.validate_batch(b).is_empty()));
    assert!(elapsed < MAX_PLANNING_TIME);
}
