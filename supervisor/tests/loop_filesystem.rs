//! Loop scenarios against a real directory.
//!
//! The agent is scripted, but every sentinel lives on disk and is read through
//! `FsSentinels`, so these cover the same file protocol a real agent uses.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use supervisor::core::status::{RunnerStatus, WaitReason};
use supervisor::core::types::InvocationParams;
use supervisor::io::invoker::Invoker;
use supervisor::io::sentinel::{FsSentinels, Sentinel, SentinelStore};
use supervisor::runner::LoopRunner;
use supervisor::task::{TaskRegistry, TaskStatus};
use supervisor::test_support::{
    ScriptedInvoker, ScriptedRun, design_dir, fast_options, join_within, wait_for,
};

const SETTLE: Duration = Duration::from_secs(5);

fn runner_for(dir: &Path, invoker: &Arc<ScriptedInvoker>, max_attempts: u32) -> LoopRunner {
    let agent: Arc<dyn Invoker> = invoker.clone();
    LoopRunner::builder(dir, InvocationParams::new("test/model"))
        .options(fast_options(max_attempts))
        .invoker(agent)
        .build()
}

fn fs_invoker(dir: &Path, runs: Vec<ScriptedRun>) -> Arc<ScriptedInvoker> {
    let store: Arc<dyn SentinelStore> = Arc::new(FsSentinels::new(dir));
    Arc::new(ScriptedInvoker::new(store, runs))
}

#[test]
fn missing_design_fails_before_touching_the_directory() {
    let temp = tempfile::tempdir().expect("tempdir");
    let invoker = fs_invoker(temp.path(), vec![ScriptedRun::ok()]);
    let runner = runner_for(temp.path(), &invoker, 3);

    runner.start().expect("start");
    assert!(join_within(&runner, SETTLE));

    assert_eq!(runner.status(), RunnerStatus::Failed);
    assert_eq!(invoker.launches(), 0);
    assert!(!temp.path().join(Sentinel::Plan.file_name()).exists());
}

/// Five checkpointed sessions, then done on the sixth.
#[test]
fn checkpoint_cycle_runs_to_completion() {
    let dir = design_dir();
    fs::write(dir.path().join("RALPH-COMPLETE.md"), "stale").expect("write");
    let mut runs: Vec<ScriptedRun> = (0..5)
        .map(|_| ScriptedRun::ok().creating(Sentinel::Checkpoint))
        .collect();
    runs.push(ScriptedRun::ok().creating(Sentinel::Done));
    let invoker = fs_invoker(dir.path(), runs);
    let runner = runner_for(dir.path(), &invoker, 40);

    runner.start().expect("start");
    assert!(join_within(&runner, SETTLE));

    let snapshot = runner.snapshot();
    assert_eq!(snapshot.status, RunnerStatus::Completed);
    assert_eq!(snapshot.attempt, 6);
    assert_eq!(snapshot.waits.checkpoint, 5);
    assert!(!dir.path().join("RALPH-CHECKPOINT.md").exists());
    assert!(dir.path().join("RALPH-PLAN.md").exists());
    assert!(dir.path().join("RALPH-PROGRESS.md").exists());
}

#[test]
fn stop_file_written_by_operator_halts_loop() {
    let dir = design_dir();
    let invoker = fs_invoker(dir.path(), vec![ScriptedRun::exit(1)]);
    let agent: Arc<dyn Invoker> = invoker.clone();
    let runner = LoopRunner::builder(dir.path(), InvocationParams::new("test/model"))
        .options(supervisor::runner::RunnerOptions {
            delay: Duration::from_millis(300),
            ..fast_options(10)
        })
        .invoker(agent)
        .build();

    runner.start().expect("start");
    assert!(wait_for(SETTLE, || {
        runner.waiting_reason() == Some(WaitReason::Backoff)
    }));
    fs::write(dir.path().join("RALPH-STOP"), "").expect("write stop");

    assert!(join_within(&runner, SETTLE));
    assert_eq!(runner.status(), RunnerStatus::Stopped);
    assert_eq!(invoker.launches(), 1);
}

#[test]
fn task_reports_blocked_from_file() {
    let dir = design_dir();
    let invoker = fs_invoker(
        dir.path(),
        vec![
            ScriptedRun::ok()
                .creating(Sentinel::Blocked)
                .creating(Sentinel::Checkpoint),
        ],
    );
    let runner = runner_for(dir.path(), &invoker, 5);
    let mut registry = TaskRegistry::new();
    let id = registry.insert(dir.path(), Some(runner));
    let task = registry.get(id).expect("task");
    task.start().expect("start");

    assert!(wait_for(SETTLE, || !task.is_runner_active()));
    assert!(task.is_blocked());
    assert!(!task.is_complete());
    assert_eq!(task.derived_status(), TaskStatus::Blocked);
    assert_eq!(task.runner_status_label(), "blocked");
    let store = FsSentinels::new(dir.path());
    assert!(!store.exists(Sentinel::Checkpoint).expect("exists"));
}
