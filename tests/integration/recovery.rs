//! Checkpoint, rollback, and restart integration tests.
//!
//! These tests persist state through `FileStore`, then reopen the state
//! directory with a new orchestrator the way a restarted process would.

use std::fs;

use forgeplan::config::Config;
use forgeplan::core::task::{TaskId, TaskStatus};
use forgeplan::orchestration::{handler_fn, PhaseOutcome, RunOutcome};
use forgeplan::state::{CheckpointManager, CheckpointStatus};
use forgeplan::workflow::{BuildPhase, Metadata, RunControl};

use crate::fixtures::{abc_tasks, TestState};

fn step_config() -> Config {
    Config {
        continuous: false,
        ..Default::default()
    }
}

/// Test: Restart mid-build
/// Given a step-mode build stopped after three phases
/// When the state directory is reopened
/// Then tasks, phases, and checkpoints are restored and the loop resumes
#[test]
fn test_reopen_resumes_build() {
    let state = TestState::new();
    {
        let mut orch = state.open(&step_config());
        orch.load_tasks(abc_tasks()).unwrap();
        for _ in 0..3 {
            orch.run().unwrap();
        }
        let a = TaskId::from("A");
        orch.queue_mut().start_task(&a).unwrap();
        orch.queue_mut().complete_task(&a).unwrap();
    }

    let mut orch = state.open(&step_config());
    assert_eq!(orch.queue().len(), 3);
    assert_eq!(orch.queue().status(&TaskId::from("A")), Some(TaskStatus::Completed));
    assert_eq!(orch.queue().status(&TaskId::from("B")), Some(TaskStatus::Ready));
    assert_eq!(orch.graph().task_count(), 3);
    assert_eq!(orch.checkpoints().list_checkpoints().len(), 3);
    assert_eq!(orch.phases().progress_percent(), 37.5);

    let report = orch.run().unwrap();
    assert_eq!(report.phases_completed, vec![BuildPhase::BatchCreation]);
    assert_eq!(
        report.outcome,
        RunOutcome::AwaitingConfirmation {
            next: BuildPhase::CodeGeneration
        }
    );
}

/// Test: Checkpoint files on disk
#[test]
fn test_checkpoint_records_layout() {
    let state = TestState::new();
    let mut orch = state.open(&Config::default());
    orch.load_tasks(abc_tasks()).unwrap();
    orch.run().unwrap();

    assert!(state.path.join("task_queue.json").exists());
    assert!(state.path.join("phase_state.json").exists());
    assert!(state.path.join("checkpoints/index.json").exists());
    for checkpoint in orch.checkpoints().list_checkpoints() {
        let file = state.path.join(format!("checkpoints/{}.json", checkpoint.id));
        assert!(file.exists(), "missing {}", file.display());
    }

    let reloaded = CheckpointManager::load(state.store()).unwrap();
    assert_eq!(reloaded.list_checkpoints(), orch.checkpoints().list_checkpoints());
}

/// Test: Rollback across a restart
/// Given checkpoints after every phase and work recorded in code generation
/// When the build is rolled back to batch creation and reopened
/// Then later work is undone and files to revert are reported
#[test]
fn test_rollback_survives_restart() {
    let state = TestState::new();
    let target = {
        let mut orch = state.open(&Config::default()).with_handler(
            BuildPhase::CodeGeneration,
            handler_fn(|ctx| {
                for record in ctx.dispatchable_tasks() {
                    ctx.queue.start_task(&record.id)?;
                    ctx.queue.complete_task(&record.id)?;
                }
                Ok(PhaseOutcome::success_with(
                    Metadata::new(),
                    vec!["src/a.rs".to_string(), "src/lib.rs".to_string()],
                ))
            }),
        );
        orch.load_tasks(abc_tasks()).unwrap();
        assert_eq!(orch.run().unwrap().outcome, RunOutcome::Completed);

        let target = orch
            .checkpoints()
            .list_checkpoints()
            .iter()
            .find(|c| c.phase == BuildPhase::BatchCreation)
            .map(|c| c.id)
            .unwrap();
        let result = orch.rollback_to_checkpoint(&target).unwrap();
        assert_eq!(
            result.files_to_rollback,
            vec!["src/a.rs".to_string(), "src/lib.rs".to_string()]
        );
        target
    };

    let orch = state.open(&Config::default());
    assert_eq!(orch.queue().status(&TaskId::from("A")), Some(TaskStatus::Ready));
    assert_eq!(orch.phases().next_phase(), Some(BuildPhase::CodeGeneration));

    let statuses: Vec<CheckpointStatus> = orch
        .checkpoints()
        .list_checkpoints()
        .iter()
        .map(|c| c.status)
        .collect();
    assert_eq!(&statuses[..3], &[CheckpointStatus::Created; 3]);
    assert_eq!(statuses[3], CheckpointStatus::Active);
    assert!(statuses[4..].iter().all(|s| *s == CheckpointStatus::RolledBack));

    let latest = orch.checkpoints().get_latest_checkpoint().unwrap();
    assert_eq!(latest.id, target);
}

/// Test: Corrupt phase state
/// Given an unreadable phase record
/// When the state directory is reopened
/// Then the build starts fresh instead of failing
#[test]
fn test_corrupt_phase_state_starts_fresh() {
    let state = TestState::new();
    {
        let mut orch = state.open(&step_config());
        orch.load_tasks(abc_tasks()).unwrap();
        orch.run().unwrap();
        orch.pause().unwrap();
    }
    fs::write(state.path.join("phase_state.json"), "{ not json").unwrap();

    let orch = state.open(&step_config());
    assert_eq!(orch.phases().current_phase(), None);
    assert_eq!(orch.phases().run_control(), RunControl::Running);
    assert_eq!(orch.queue().len(), 3);
}

/// Test: Pruning keeps the newest checkpoints
#[test]
fn test_keep_checkpoints_prunes_after_run() {
    let state = TestState::new();
    let config = Config {
        keep_checkpoints: Some(2),
        ..Default::default()
    };
    let mut orch = state.open(&config);
    orch.load_tasks(abc_tasks()).unwrap();
    let report = orch.run().unwrap();
    assert_eq!(report.checkpoints_created.len(), 8);

    let kept: Vec<BuildPhase> = orch
        .checkpoints()
        .list_checkpoints()
        .iter()
        .map(|c| c.phase)
        .collect();
    assert_eq!(kept, vec![BuildPhase::QualityVerification, BuildPhase::Documentation]);

    let on_disk = fs::read_dir(state.path.join("checkpoints"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name() != "index.json")
        .filter(|e| e.path().extension().map_or(false, |ext| ext == "json"))
        .count();
    assert_eq!(on_disk, 2);
}
