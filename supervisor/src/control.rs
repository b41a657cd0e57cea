//! Terminal control loop for `supervisor run`.
//!
//! Polls every task on a fixed cadence, prints status changes, resolves
//! missing-checkpoint gates according to the configured policy, and retires
//! tasks once their derived status is final and their worker has exited.

use std::collections::{HashMap, HashSet};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::Serialize;
use tracing::info;

use crate::core::status::CheckpointDecision;
use crate::exit_codes;
use crate::task::{Task, TaskId, TaskRegistry, TaskStatus};

/// What to do when an agent finishes without leaving a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MissingCheckpointPolicy {
    /// Ask on the terminal.
    Ask,
    Continue,
    Stop,
}

/// Source of operator decisions at the missing-checkpoint gate.
pub trait Prompt {
    fn ask(&mut self, task: &Task) -> Result<CheckpointDecision>;
}

/// Asks on stdout and reads the answer from a line reader (stdin in the binary).
pub struct LinePrompt<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> LinePrompt<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }
}

impl<R: BufRead, W: Write> Prompt for LinePrompt<R, W> {
    fn ask(&mut self, task: &Task) -> Result<CheckpointDecision> {
        loop {
            write!(
                self.output,
                "{} finished attempt {} without creating RALPH-CHECKPOINT.md. Continue? [y/n] ",
                task.name(),
                task.current_attempt()
            )
            .context("write prompt")?;
            self.output.flush().context("flush prompt")?;

            let mut line = String::new();
            let read = self.input.read_line(&mut line).context("read answer")?;
            if read == 0 {
                // Closed input cannot answer; stopping is the safe default.
                return Ok(CheckpointDecision::Stop);
            }
            match line.trim().to_ascii_lowercase().as_str() {
                "y" | "yes" | "c" | "continue" => return Ok(CheckpointDecision::Continue),
                "n" | "no" | "s" | "stop" => return Ok(CheckpointDecision::Stop),
                _ => writeln!(self.output, "please answer y or n").context("write prompt")?,
            }
        }
    }
}

/// Poll cadence of the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlOptions {
    pub idle_interval: Duration,
    /// Faster cadence while any task is in a timed wait, so countdowns stay fresh.
    pub waiting_interval: Duration,
}

impl Default for ControlOptions {
    fn default() -> Self {
        Self {
            idle_interval: Duration::from_secs(1),
            waiting_interval: Duration::from_millis(500),
        }
    }
}

impl ControlOptions {
    pub fn interval(&self, registry: &TaskRegistry) -> Duration {
        if registry.any_waiting() {
            self.waiting_interval
        } else {
            self.idle_interval
        }
    }
}

/// Final report for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskReport {
    pub dir: PathBuf,
    pub status: TaskStatus,
    pub attempts: u32,
    pub error: Option<String>,
    pub backup_id: String,
}

/// Drives a registry until every task has finished.
pub struct ControlLoop<'a, P, W> {
    registry: &'a mut TaskRegistry,
    policy: MissingCheckpointPolicy,
    prompt: P,
    out: W,
    options: ControlOptions,
    last_lines: HashMap<TaskId, String>,
    stopping: HashSet<TaskId>,
}

impl<'a, P: Prompt, W: Write> ControlLoop<'a, P, W> {
    pub fn new(
        registry: &'a mut TaskRegistry,
        policy: MissingCheckpointPolicy,
        prompt: P,
        out: W,
    ) -> Self {
        Self {
            registry,
            policy,
            prompt,
            out,
            options: ControlOptions::default(),
            last_lines: HashMap::new(),
            stopping: HashSet::new(),
        }
    }

    pub fn options(mut self, options: ControlOptions) -> Self {
        self.options = options;
        self
    }

    /// Poll until the registry is empty; returns one report per task in finish order.
    pub fn run(mut self) -> Result<Vec<TaskReport>> {
        let mut reports = Vec::new();
        while !self.registry.is_empty() {
            reports.extend(self.tick()?);
            if self.registry.is_empty() {
                break;
            }
            thread::sleep(self.options.interval(self.registry));
        }
        Ok(reports)
    }

    /// One polling pass. Returns reports for tasks retired in this pass.
    pub fn tick(&mut self) -> Result<Vec<TaskReport>> {
        self.resolve_gates()?;
        self.print_changes()?;

        let mut reports = Vec::new();
        for (id, status) in self.registry.finished() {
            // A blocked file can appear while the agent is still running. Ask the
            // runner to wind down and retire the task once its worker has exited.
            if let Some(task) = self.registry.get(id)
                && task.is_runner_active()
            {
                if self.stopping.insert(id) {
                    info!(task = %id, %status, "task finished while runner active; stopping");
                    task.stop();
                }
                continue;
            }
            let Some(task) = self.registry.remove(id) else {
                continue;
            };
            // Worker already exited; this only reaps the thread.
            if let Some(runner) = task.runner() {
                runner.join();
            }
            self.stopping.remove(&id);
            self.last_lines.remove(&id);
            let report = TaskReport {
                dir: task.dir().to_path_buf(),
                status,
                attempts: task.current_attempt(),
                error: task.runner_error(),
                backup_id: task.backup_id().to_string(),
            };
            let summary = match (&report.status, &report.error) {
                (TaskStatus::Failed, Some(err)) => format!("{} failed: {err}", task.name()),
                _ => format!("{} {}", task.name(), report.status),
            };
            writeln!(self.out, "{summary}").context("write report")?;
            info!(task = %id, status = %report.status, attempts = report.attempts, "task finished");
            reports.push(report);
        }
        Ok(reports)
    }

    fn resolve_gates(&mut self) -> Result<()> {
        let ids: Vec<TaskId> = self.registry.iter().map(Task::id).collect();
        for id in ids {
            let gated = self
                .registry
                .get(id)
                .is_some_and(Task::is_missing_checkpoint_pause);
            if !gated {
                self.registry.end_prompt(id);
                continue;
            }
            if !self.registry.begin_prompt(id) {
                continue;
            }
            let Some(task) = self.registry.get(id) else {
                continue;
            };
            let decision = match self.policy {
                MissingCheckpointPolicy::Continue => CheckpointDecision::Continue,
                MissingCheckpointPolicy::Stop => CheckpointDecision::Stop,
                MissingCheckpointPolicy::Ask => self.prompt.ask(task)?,
            };
            info!(task = %id, ?decision, "missing-checkpoint decision");
            match decision {
                CheckpointDecision::Continue => task.continue_after_missing_checkpoint(),
                CheckpointDecision::Stop => task.stop_after_missing_checkpoint(),
            }
        }
        Ok(())
    }

    fn print_changes(&mut self) -> Result<()> {
        for task in self.registry.iter() {
            let line = task.display_line();
            // Elapsed time and countdowns tick every poll; compare without them.
            let key = line_key(&line);
            let changed = self
                .last_lines
                .get(&task.id())
                .is_none_or(|prev| line_key(prev) != key);
            if changed {
                writeln!(self.out, "  {line}").context("write status")?;
                self.last_lines.insert(task.id(), line);
            }
        }
        Ok(())
    }
}

fn line_key(line: &str) -> &str {
    line.split(" - ").next().unwrap_or(line)
}

/// Process exit code summarizing a batch: any failure, then blocked, then stopped.
pub fn exit_code(reports: &[TaskReport]) -> i32 {
    let any = |status| reports.iter().any(|r| r.status == status);
    if any(TaskStatus::Failed) {
        exit_codes::INVALID
    } else if any(TaskStatus::Blocked) {
        exit_codes::BLOCKED
    } else if any(TaskStatus::Stopped) {
        exit_codes::STOPPED
    } else {
        exit_codes::OK
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::Arc;
    use std::time::Instant;

    use super::*;
    use crate::io::sentinel::Sentinel;
    use crate::test_support::{
        MemorySentinels, ScriptedInvoker, ScriptedRun, fast_options, scripted_runner, wait_for,
    };

    struct CountingPrompt {
        answer: CheckpointDecision,
        asked: usize,
    }

    impl Prompt for &mut CountingPrompt {
        fn ask(&mut self, _task: &Task) -> Result<CheckpointDecision> {
            self.asked += 1;
            Ok(self.answer)
        }
    }

    fn fast_control() -> ControlOptions {
        ControlOptions {
            idle_interval: Duration::from_millis(10),
            waiting_interval: Duration::from_millis(5),
        }
    }

    fn registry_with(runs: Vec<ScriptedRun>) -> (TaskRegistry, Arc<ScriptedInvoker>) {
        let store = Arc::new(MemorySentinels::with_design());
        let invoker = Arc::new(ScriptedInvoker::new(store.clone(), runs));
        let runner = scripted_runner(&store, &invoker, fast_options(5));
        let mut registry = TaskRegistry::new();
        let id = registry.insert_with_sentinels("/work/alpha", store, Some(runner));
        registry.get(id).expect("task").start().expect("start");
        (registry, invoker)
    }

    #[test]
    fn continue_policy_resumes_and_completes() {
        let (mut registry, invoker) = registry_with(vec![
            ScriptedRun::ok(),
            ScriptedRun::ok().creating(Sentinel::Done),
        ]);
        let mut prompt = CountingPrompt {
            answer: CheckpointDecision::Stop,
            asked: 0,
        };
        let mut out = Vec::new();
        let reports = ControlLoop::new(
            &mut registry,
            MissingCheckpointPolicy::Continue,
            &mut prompt,
            &mut out,
        )
        .options(fast_control())
        .run()
        .expect("run");

        assert_eq!(prompt.asked, 0);
        assert_eq!(invoker.launches(), 2);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, TaskStatus::Completed);
        assert_eq!(reports[0].attempts, 2);
        assert_eq!(exit_code(&reports), exit_codes::OK);
        let printed = String::from_utf8(out).expect("utf8");
        assert!(printed.contains("alpha completed"));
    }

    #[test]
    fn ask_policy_prompts_once_per_episode() {
        let (mut registry, invoker) = registry_with(vec![ScriptedRun::ok()]);
        let mut prompt = CountingPrompt {
            answer: CheckpointDecision::Stop,
            asked: 0,
        };
        let reports = ControlLoop::new(
            &mut registry,
            MissingCheckpointPolicy::Ask,
            &mut prompt,
            std::io::sink(),
        )
        .options(fast_control())
        .run()
        .expect("run");

        assert_eq!(prompt.asked, 1);
        assert_eq!(invoker.launches(), 1);
        assert_eq!(reports[0].status, TaskStatus::Stopped);
        assert_eq!(exit_code(&reports), exit_codes::STOPPED);
    }

    #[test]
    fn blocked_file_during_invocation_stops_runner_without_stalling() {
        let (mut registry, invoker) =
            registry_with(vec![ScriptedRun::held().creating(Sentinel::Blocked)]);
        assert!(wait_for(Duration::from_secs(5), || invoker.live() == 1));

        let mut prompt = CountingPrompt {
            answer: CheckpointDecision::Stop,
            asked: 0,
        };
        let mut control = ControlLoop::new(
            &mut registry,
            MissingCheckpointPolicy::Stop,
            &mut prompt,
            std::io::sink(),
        )
        .options(fast_control());

        let started = Instant::now();
        let mut reports = control.tick().expect("tick");
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(reports.is_empty(), "task retired while its worker was alive");

        assert!(wait_for(Duration::from_secs(5), || {
            reports.extend(control.tick().expect("tick"));
            !reports.is_empty()
        }));
        drop(control);

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, TaskStatus::Blocked);
        assert_eq!(invoker.live(), 0);
        assert_eq!(invoker.launches(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn line_prompt_retries_until_clear_answer() {
        let task = Task::new(TaskId(1), "/work/beta", None);
        let mut output = Vec::new();
        let mut prompt = LinePrompt::new(Cursor::new("maybe\nY\n"), &mut output);
        assert_eq!(prompt.ask(&task).expect("ask"), CheckpointDecision::Continue);
        let printed = String::from_utf8(output).expect("utf8");
        assert!(printed.contains("please answer y or n"));
        assert_eq!(printed.matches("Continue? [y/n]").count(), 2);

        let mut closed = LinePrompt::new(Cursor::new(""), std::io::sink());
        assert_eq!(closed.ask(&task).expect("ask"), CheckpointDecision::Stop);
    }

    #[test]
    fn exit_code_prefers_failure_then_blocked() {
        let report = |status| TaskReport {
            dir: PathBuf::from("/x"),
            status,
            attempts: 1,
            error: None,
            backup_id: String::new(),
        };
        assert_eq!(exit_code(&[]), exit_codes::OK);
        assert_eq!(
            exit_code(&[report(TaskStatus::Stopped), report(TaskStatus::Blocked)]),
            exit_codes::BLOCKED
        );
        assert_eq!(
            exit_code(&[report(TaskStatus::Blocked), report(TaskStatus::Failed)]),
            exit_codes::INVALID
        );
    }

    #[test]
    fn idle_interval_is_one_second() {
        let registry = TaskRegistry::new();
        let options = ControlOptions::default();
        assert_eq!(options.interval(&registry), Duration::from_secs(1));
    }
}
