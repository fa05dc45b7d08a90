//! End-to-end planning and phase loop tests.
//!
//! These tests load a plan, analyze it, batch the ready work, and drive
//! the eight build phases with injected handlers.

use std::collections::HashSet;

use forgeplan::config::Config;
use forgeplan::core::dag::DependencyGraph;
use forgeplan::core::task::{load_records, Complexity, TaskId, TaskStatus};
use forgeplan::orchestration::{handler_fn, Orchestrator, PhaseOutcome, RunOutcome};
use forgeplan::workflow::{BlockerKind, BuildPhase, Metadata, PhaseStatus};
use forgeplan::Error;

use crate::fixtures::{abc_tasks, chain_tasks, diamond_tasks, task, TestState};

fn ids(list: &[TaskId]) -> Vec<&str> {
    list.iter().map(TaskId::as_str).collect()
}

/// Test: A/B/C walkthrough
/// Given A -> B, A -> C with B and C in different domains
/// When A completes
/// Then B and C are ready together but batched separately
#[test]
fn test_abc_plan_walkthrough() {
    let mut orch = Orchestrator::in_memory(&Config::default()).unwrap();
    orch.load_tasks(abc_tasks()).unwrap();

    let analysis = orch.analyze_dependencies().unwrap();
    let levels: Vec<Vec<&str>> = analysis.levels.iter().map(|l| ids(&l.task_ids)).collect();
    assert_eq!(levels, vec![vec!["A"], vec!["B", "C"]]);

    let ready: Vec<String> = orch.queue().ready_tasks().iter().map(|t| t.id.to_string()).collect();
    assert_eq!(ready, vec!["A"]);

    let a = TaskId::from("A");
    orch.queue_mut().start_task(&a).unwrap();
    let promoted = orch.queue_mut().complete_task(&a).unwrap();
    assert_eq!(ids(&promoted), vec!["B", "C"]);

    let batches = orch.plan_batches();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].task_ids(), vec!["B"]);
    assert_eq!(batches[1].task_ids(), vec!["C"]);
    for batch in &batches {
        assert!(orch.optimizer().validate_batch(batch).is_empty());
    }
}

/// Test: Critical path of a chain
#[test]
fn test_chain_critical_path() {
    let mut graph = DependencyGraph::new();
    graph.build_graph(&chain_tasks()).unwrap();

    let path = graph.get_critical_path().unwrap();
    assert_eq!(ids(&path.tasks), vec!["A", "B", "C"]);
    assert_eq!(path.total_duration, 270);
}

/// Test: Cycle rejection
/// Given A -> B -> C -> A
/// When the plan is loaded
/// Then the structural error names the cycle and no levels exist
#[test]
fn test_cycle_is_rejected_everywhere() {
    let cyclic = vec![
        task("A", "backend", Complexity::Simple, 10, &["C"]),
        task("B", "backend", Complexity::Simple, 10, &["A"]),
        task("C", "backend", Complexity::Simple, 10, &["B"]),
    ];

    let mut graph = DependencyGraph::new();
    match graph.build_graph(&cyclic) {
        Err(Error::CircularDependency { cycle }) => {
            assert_eq!(cycle.first(), cycle.last());
            assert_eq!(cycle.len(), 4);
        }
        other => panic!("expected a cycle error, got {:?}", other),
    }
    assert!(graph.get_execution_levels().unwrap().is_empty());

    let mut orch = Orchestrator::in_memory(&Config::default()).unwrap();
    assert!(matches!(
        orch.load_tasks(cyclic),
        Err(Error::CircularDependency { .. })
    ));
    assert!(orch.queue().is_empty());
}

/// Test: Levels respect dependencies
#[test]
fn test_levels_form_topological_order() {
    let mut graph = DependencyGraph::new();
    graph.build_graph(&diamond_tasks()).unwrap();

    let levels = graph.get_execution_levels().unwrap();
    let mut seen: HashSet<TaskId> = HashSet::new();
    for level in &levels {
        for id in &level.task_ids {
            for dep in graph.get_dependencies(id, false) {
                assert!(seen.contains(&dep), "{} scheduled before {}", id, dep);
            }
        }
        seen.extend(level.task_ids.iter().cloned());
    }
    assert_eq!(seen.len(), 4);
    assert_eq!(levels.iter().map(|l| l.parallel_count()).collect::<Vec<_>>(), vec![1, 2, 1]);
}

/// Test: Records from a JSON file
#[test]
fn test_plan_from_json_file() {
    let state = TestState::new();
    std::fs::create_dir_all(&state.path).unwrap();
    let path = state.path.join("tasks.json");
    std::fs::write(
        &path,
        r#"[
            {"id": "schema", "name": "Define schema", "description": "Tables and keys",
             "domain": "backend", "complexity": "simple", "duration_minutes": 45},
            {"id": "api", "name": "Build API", "description": "REST endpoints",
             "domain": "backend", "complexity": "medium",
             "duration_minutes": 120, "dependencies": ["schema"],
             "acceptance_criteria": ["returns 200"]},
            {"id": "docs", "name": "Write docs", "description": "User guide",
             "domain": "documentation", "complexity": "simple", "duration_minutes": 30,
             "dependencies": ["api"]}
        ]"#,
    )
    .unwrap();

    let records = load_records(&path).unwrap();
    assert_eq!(records[1].complexity, Complexity::Medium);
    assert_eq!(records[1].acceptance_criteria, vec!["returns 200".to_string()]);

    let mut orch = state.open(&Config::default());
    orch.load_tasks(records).unwrap();
    let analysis = orch.analyze_dependencies().unwrap();
    assert_eq!(analysis.critical_path_minutes(), 195);
    assert_eq!(analysis.levels.len(), 3);
}

/// Test: Full build with task work
/// Given a handler that completes every task during code generation
/// When the loop runs continuously
/// Then all phases complete and the final checkpoint lists every task
#[test]
fn test_full_build_completes_tasks() {
    let mut orch = Orchestrator::in_memory(&Config::default())
        .unwrap()
        .with_handler(
            BuildPhase::CodeGeneration,
            handler_fn(|ctx| {
                let mut files = Vec::new();
                loop {
                    let ready = ctx.dispatchable_tasks();
                    if ready.is_empty() {
                        break;
                    }
                    for record in ready {
                        ctx.queue.start_task(&record.id)?;
                        ctx.queue.complete_task(&record.id)?;
                        files.push(format!("src/{}.rs", record.id));
                    }
                }
                Ok(PhaseOutcome::success_with(Metadata::new(), files))
            }),
        );
    orch.load_tasks(diamond_tasks()).unwrap();

    let report = orch.run().unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.progress_percent, 100.0);

    let progress = orch.queue().progress();
    assert_eq!(progress.completed, 4);
    assert_eq!(progress.percent_complete, 100.0);
    assert!(orch.queue().is_finished());

    let latest = orch.checkpoints().get_latest_checkpoint().unwrap();
    assert_eq!(latest.phase, BuildPhase::Documentation);
    assert_eq!(ids(&latest.completed_tasks), vec!["root", "left", "right", "join"]);
}

/// Test: Blocker halts the loop
/// Given an external blocker raised mid-build
/// When the loop runs
/// Then no phase starts until the blocker is cleared
#[test]
fn test_external_blocker_halts_run() {
    let config = Config {
        continuous: false,
        ..Default::default()
    };
    let mut orch = Orchestrator::in_memory(&config).unwrap();
    orch.load_tasks(abc_tasks()).unwrap();

    orch.run().unwrap();
    orch.add_blocker(BlockerKind::MissingCredentials, "no deploy token")
        .unwrap();
    assert_eq!(
        orch.phases().phase_status(BuildPhase::SpecParsing),
        PhaseStatus::Completed
    );

    let report = orch.run().unwrap();
    assert_eq!(
        report.outcome,
        RunOutcome::PausedForBlockers {
            blockers: vec![BlockerKind::MissingCredentials]
        }
    );
    assert!(report.phases_completed.is_empty());

    orch.clear_blocker(BlockerKind::MissingCredentials).unwrap();
    orch.set_continuous_mode(true).unwrap();
    assert_eq!(orch.run().unwrap().outcome, RunOutcome::Completed);
}

/// Test: Retries exhaust into terminal failure
#[test]
fn test_task_failure_after_max_retries() {
    let config = Config {
        max_retries: 2,
        ..Default::default()
    };
    let mut orch = Orchestrator::in_memory(&config).unwrap();
    orch.load_tasks(abc_tasks()).unwrap();
    let a = TaskId::from("A");

    orch.queue_mut().start_task(&a).unwrap();
    assert_eq!(orch.queue_mut().fail_task(&a, "flaky").unwrap(), TaskStatus::Ready);
    orch.queue_mut().start_task(&a).unwrap();
    assert_eq!(orch.queue_mut().fail_task(&a, "flaky").unwrap(), TaskStatus::Failed);

    assert!(orch.queue().ready_tasks().is_empty());
    assert_eq!(orch.queue().progress().failed, 1);
}
