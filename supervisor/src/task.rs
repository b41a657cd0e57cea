//! Tasks: a supervised directory paired with its runner.
//!
//! A [`Task`] only adds derived views over its [`LoopRunner`]. Completion and
//! blocking are read from the sentinel files rather than from runner state, so
//! a task reports correctly even while the runner is still winding down.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::elapsed::format_elapsed;
use crate::core::status::RunnerStatus;
use crate::io::sentinel::{FsSentinels, Sentinel, SentinelStore};
use crate::runner::{LoopRunner, StartError};

/// Registry key for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Outcome of a task as seen by the control layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Completed,
    Blocked,
    Stopped,
    Failed,
}

impl TaskStatus {
    pub fn is_finished(self) -> bool {
        self != TaskStatus::Running
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Stopped => "stopped",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct Task {
    id: TaskId,
    dir: PathBuf,
    backup_id: Uuid,
    started_at: Instant,
    sentinels: Arc<dyn SentinelStore>,
    runner: Option<LoopRunner>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("dir", &self.dir)
            .field("backup_id", &self.backup_id)
            .field("runner", &self.runner)
            .finish_non_exhaustive()
    }
}

impl Task {
    /// Task over `dir`, reading sentinels from the real filesystem.
    pub fn new(id: TaskId, dir: impl Into<PathBuf>, runner: Option<LoopRunner>) -> Self {
        let dir = dir.into();
        let sentinels: Arc<dyn SentinelStore> = Arc::new(FsSentinels::new(&dir));
        Self::with_sentinels(id, dir, sentinels, runner)
    }

    pub fn with_sentinels(
        id: TaskId,
        dir: impl Into<PathBuf>,
        sentinels: Arc<dyn SentinelStore>,
        runner: Option<LoopRunner>,
    ) -> Self {
        Self {
            id,
            dir: dir.into(),
            backup_id: Uuid::new_v4(),
            started_at: Instant::now(),
            sentinels,
            runner,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Identifier reserved for archiving this task's files when it finishes.
    pub fn backup_id(&self) -> Uuid {
        self.backup_id
    }

    pub fn runner(&self) -> Option<&LoopRunner> {
        self.runner.as_ref()
    }

    /// Directory name for display, falling back to the full path.
    pub fn name(&self) -> String {
        self.dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.dir.display().to_string())
    }

    pub fn start(&self) -> Result<(), StartError> {
        match &self.runner {
            Some(runner) => runner.start(),
            None => Ok(()),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn elapsed_display(&self) -> String {
        format_elapsed(self.elapsed())
    }

    pub fn current_attempt(&self) -> u32 {
        self.runner.as_ref().map_or(0, LoopRunner::current_attempt)
    }

    pub fn is_complete(&self) -> bool {
        self.sentinel_present(Sentinel::Done)
    }

    pub fn is_blocked(&self) -> bool {
        self.sentinel_present(Sentinel::Blocked)
    }

    fn sentinel_present(&self, sentinel: Sentinel) -> bool {
        match self.sentinels.exists(sentinel) {
            Ok(present) => present,
            Err(err) => {
                warn!(task = %self.id, err = %format!("{err:#}"), "sentinel check failed");
                false
            }
        }
    }

    /// Whether the runner's worker thread is still alive.
    pub fn is_runner_active(&self) -> bool {
        self.runner.as_ref().is_some_and(LoopRunner::is_running)
    }

    pub fn runner_status(&self) -> Option<RunnerStatus> {
        self.runner.as_ref().map(LoopRunner::status)
    }

    /// Runner status label, or `unknown` without a runner.
    pub fn runner_status_label(&self) -> &'static str {
        self.runner_status().map_or("unknown", RunnerStatus::label)
    }

    pub fn runner_error(&self) -> Option<String> {
        self.runner.as_ref().and_then(LoopRunner::error_message)
    }

    pub fn is_waiting(&self) -> bool {
        self.runner.as_ref().is_some_and(LoopRunner::is_waiting)
    }

    /// `(is_waiting, reason, seconds_remaining)`; `(false, "", 0)` without a runner.
    pub fn waiting_info(&self) -> (bool, String, u64) {
        let Some(runner) = &self.runner else {
            return (false, String::new(), 0);
        };
        let snapshot = runner.snapshot();
        match snapshot.waiting {
            Some(wait) => (true, wait.reason.to_string(), wait.seconds_remaining),
            None => (false, String::new(), 0),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.runner.as_ref().is_some_and(LoopRunner::is_paused)
    }

    pub fn is_pause_pending(&self) -> bool {
        self.runner.as_ref().is_some_and(LoopRunner::pause_pending)
    }

    pub fn is_missing_checkpoint_pause(&self) -> bool {
        self.runner
            .as_ref()
            .is_some_and(LoopRunner::is_missing_checkpoint_pause)
    }

    pub fn pause(&self) {
        if let Some(runner) = &self.runner {
            runner.pause();
        }
    }

    pub fn resume(&self) {
        if let Some(runner) = &self.runner {
            runner.resume();
        }
    }

    pub fn stop(&self) {
        if let Some(runner) = &self.runner {
            runner.stop();
        }
    }

    pub fn force_kill(&self) {
        if let Some(runner) = &self.runner {
            runner.force_kill();
        }
    }

    pub fn continue_after_missing_checkpoint(&self) {
        if let Some(runner) = &self.runner {
            runner.continue_after_missing_checkpoint();
        }
    }

    pub fn stop_after_missing_checkpoint(&self) {
        if let Some(runner) = &self.runner {
            runner.stop_after_missing_checkpoint();
        }
    }

    /// Task outcome combining sentinel files with runner state.
    ///
    /// The done file only counts once the runner has exited; the blocked file
    /// counts immediately. Otherwise an exited runner's terminal status wins.
    pub fn derived_status(&self) -> TaskStatus {
        let active = self.is_runner_active();
        if self.is_complete() && !active {
            return TaskStatus::Completed;
        }
        if self.is_blocked() {
            return TaskStatus::Blocked;
        }
        if self.runner.is_some() && !active {
            match self.runner_status() {
                Some(RunnerStatus::Completed) => return TaskStatus::Completed,
                Some(RunnerStatus::Blocked) => return TaskStatus::Blocked,
                Some(RunnerStatus::Stopped) => return TaskStatus::Stopped,
                Some(RunnerStatus::Failed) => return TaskStatus::Failed,
                _ => {}
            }
        }
        TaskStatus::Running
    }

    /// One-line summary such as `[#3] my-project - 1m 5s (attempt 3)`.
    pub fn display_line(&self) -> String {
        let attempt = self.current_attempt();
        let (waiting, reason, remaining) = self.waiting_info();
        let icon = if self.is_paused() {
            "[PAUSED]".to_string()
        } else if self.is_pause_pending() {
            "[STOPPING]".to_string()
        } else if self.is_missing_checkpoint_pause() {
            "[NO CHECKPOINT]".to_string()
        } else if waiting {
            format!("[wait:{reason}]")
        } else {
            match self.runner_status() {
                Some(RunnerStatus::Running) if attempt > 0 => format!("[#{attempt}]"),
                Some(RunnerStatus::Running | RunnerStatus::Pending) => "[...]".to_string(),
                Some(RunnerStatus::Stopped) => "[STOPPED]".to_string(),
                Some(RunnerStatus::Failed) => "[FAILED]".to_string(),
                Some(RunnerStatus::Blocked) => "[BLOCKED]".to_string(),
                _ => "[OK]".to_string(),
            }
        };

        let name = self.name();
        if waiting {
            format!("{icon} {name} - {remaining}s")
        } else if attempt > 0 {
            format!(
                "{icon} {name} - {} (attempt {attempt})",
                self.elapsed_display()
            )
        } else {
            format!("{icon} {name} - {}", self.elapsed_display())
        }
    }
}

/// Tasks keyed by id, plus per-task prompt bookkeeping for the control loop.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: BTreeMap<TaskId, Task>,
    next_id: u64,
    prompting: HashSet<TaskId>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a filesystem-backed task for `dir`.
    pub fn insert(&mut self, dir: impl Into<PathBuf>, runner: Option<LoopRunner>) -> TaskId {
        let id = self.allocate();
        self.tasks.insert(id, Task::new(id, dir, runner));
        id
    }

    pub fn insert_with_sentinels(
        &mut self,
        dir: impl Into<PathBuf>,
        sentinels: Arc<dyn SentinelStore>,
        runner: Option<LoopRunner>,
    ) -> TaskId {
        let id = self.allocate();
        self.tasks
            .insert(id, Task::with_sentinels(id, dir, sentinels, runner));
        id
    }

    fn allocate(&mut self) -> TaskId {
        self.next_id += 1;
        TaskId(self.next_id)
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn remove(&mut self, id: TaskId) -> Option<Task> {
        self.prompting.remove(&id);
        self.tasks.remove(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn any_waiting(&self) -> bool {
        self.tasks.values().any(Task::is_waiting)
    }

    /// Start a missing-checkpoint prompt for `id`. Returns `false` if one is already open.
    pub fn begin_prompt(&mut self, id: TaskId) -> bool {
        let fresh = self.prompting.insert(id);
        if fresh {
            debug!(task = %id, "missing-checkpoint prompt opened");
        }
        fresh
    }

    /// Close the prompt for `id` so the next missing-checkpoint episode asks again.
    pub fn end_prompt(&mut self, id: TaskId) {
        self.prompting.remove(&id);
    }

    /// Ids of tasks whose derived status is no longer running.
    pub fn finished(&self) -> Vec<(TaskId, TaskStatus)> {
        self.tasks
            .values()
            .map(|task| (task.id, task.derived_status()))
            .filter(|(_, status)| status.is_finished())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        MemorySentinels, ScriptedInvoker, ScriptedRun, fast_options, scripted_runner, wait_for,
    };

    #[test]
    fn task_without_runner_reports_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let task = Task::new(TaskId(1), temp.path(), None);

        assert_eq!(task.current_attempt(), 0);
        assert_eq!(task.runner_status_label(), "unknown");
        assert_eq!(task.waiting_info(), (false, String::new(), 0));
        assert!(!task.is_runner_active());
        assert!(!task.is_paused());
        assert!(task.runner_error().is_none());
        assert_eq!(task.derived_status(), TaskStatus::Running);
        assert!(task.start().is_ok());

        // Controls are no-ops.
        task.pause();
        task.resume();
        task.stop();
        task.force_kill();
        task.continue_after_missing_checkpoint();
        task.stop_after_missing_checkpoint();
    }

    #[test]
    fn completion_and_blocking_come_from_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let task = Task::new(TaskId(1), temp.path(), None);
        assert!(!task.is_complete());

        std::fs::write(temp.path().join("RALPH-BLOCKED.md"), "stuck").expect("write");
        assert!(task.is_blocked());
        assert_eq!(task.derived_status(), TaskStatus::Blocked);

        std::fs::write(temp.path().join("RALPH-COMPLETE.md"), "").expect("write");
        assert!(task.is_complete());
        assert_eq!(task.derived_status(), TaskStatus::Completed);
    }

    #[test]
    fn backup_ids_are_unique_v4() {
        let a = Task::new(TaskId(1), "/a", None);
        let b = Task::new(TaskId(2), "/b", None);
        assert_ne!(a.backup_id(), b.backup_id());
        assert_eq!(a.backup_id().get_version_num(), 4);
    }

    #[test]
    fn derived_status_follows_finished_runner() {
        let store = Arc::new(MemorySentinels::with_design());
        let invoker = Arc::new(ScriptedInvoker::new(
            store.clone(),
            vec![ScriptedRun::exit(1), ScriptedRun::exit(1)],
        ));
        let runner = scripted_runner(&store, &invoker, fast_options(2));
        let mut registry = TaskRegistry::new();
        let id = registry.insert_with_sentinels("/supervised", store.clone(), Some(runner));

        let task = registry.get(id).expect("task");
        task.start().expect("start");
        assert!(wait_for(Duration::from_secs(5), || !task.is_runner_active()));

        assert_eq!(task.derived_status(), TaskStatus::Failed);
        assert_eq!(task.runner_status_label(), "failed");
        assert_eq!(task.runner_error().as_deref(), Some("max attempts reached"));
        assert!(task.display_line().starts_with("[FAILED] supervised"));
        assert_eq!(registry.finished(), vec![(id, TaskStatus::Failed)]);
    }

    #[test]
    fn waiting_info_reports_reason_and_remaining() {
        let store = Arc::new(MemorySentinels::with_design());
        let invoker = Arc::new(ScriptedInvoker::new(store.clone(), vec![ScriptedRun::exit(1)]));
        let options = crate::runner::RunnerOptions {
            delay: Duration::from_secs(30),
            ..fast_options(3)
        };
        let runner = scripted_runner(&store, &invoker, options);
        let task = Task::with_sentinels(TaskId(7), "/supervised", store.clone(), Some(runner));
        task.start().expect("start");
        assert!(wait_for(Duration::from_secs(5), || task.is_waiting()));

        let (waiting, reason, remaining) = task.waiting_info();
        assert!(waiting);
        assert_eq!(reason, "backoff");
        assert!(remaining > 0 && remaining <= 30);
        assert!(task.display_line().starts_with("[wait:backoff] supervised - "));

        task.force_kill();
        assert_eq!(task.waiting_info(), (false, String::new(), 0));
        assert!(wait_for(Duration::from_secs(5), || !task.is_runner_active()));
        assert_eq!(task.derived_status(), TaskStatus::Stopped);
    }

    #[test]
    fn registry_prompts_once_per_episode() {
        let mut registry = TaskRegistry::new();
        let a = registry.insert("/a", None);
        let b = registry.insert("/b", None);
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);

        assert!(registry.begin_prompt(a));
        assert!(!registry.begin_prompt(a));
        assert!(registry.begin_prompt(b));
        registry.end_prompt(a);
        assert!(registry.begin_prompt(a));

        // Removing a task drops its open prompt with it.
        assert!(registry.remove(b).is_some());
        let c = registry.insert("/c", None);
        assert!(registry.begin_prompt(c));
        assert_eq!(registry.len(), 2);
    }
}
