//! The supervision loop for one directory.
//!
//! A [`LoopRunner`] owns a background thread that drives the agent through
//! attempts until a sentinel, an operator, or the attempt budget ends the run.
//! Operator commands never block: they flip state under the control mutex and
//! wake the worker through a condvar. The worker only honors them at its
//! suspension points (pause boundary, waits, invocation poll, checkpoint gate).

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn};

use crate::core::status::{CheckpointDecision, RunnerStatus, WaitReason};
use crate::core::types::{InvocationOutcome, InvocationParams};
use crate::core::waiting::{WaitTally, WaitTracker};
use crate::io::config::SupervisorConfig;
use crate::io::invoker::{CliInvoker, InvokeRequest, Invoker};
use crate::io::process::AgentHandle;
use crate::io::sentinel::{
    FsSentinels, Sentinel, SentinelStore, consume_checkpoint, scaffold_if_absent,
};
use crate::io::templates::Templates;

/// Loop tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerOptions {
    pub max_attempts: u32,
    /// Length of every checkpoint/backoff/cooldown wait.
    pub delay: Duration,
    /// Agent exit poll period; bounds stop latency while an agent runs.
    pub poll_interval: Duration,
    pub stop_grace: Duration,
    pub kill_grace: Duration,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self::from(&SupervisorConfig::default())
    }
}

impl From<&SupervisorConfig> for RunnerOptions {
    fn from(cfg: &SupervisorConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            delay: cfg.delay(),
            poll_interval: cfg.poll_interval(),
            stop_grace: cfg.stop_grace(),
            kill_grace: cfg.kill_grace(),
        }
    }
}

/// Why [`LoopRunner::start`] refused to start.
#[derive(Debug)]
pub enum StartError {
    AlreadyRunning,
    /// The runner already reached a terminal status; build a new one.
    Finished(RunnerStatus),
    Spawn(std::io::Error),
}

impl fmt::Display for StartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartError::AlreadyRunning => f.write_str("runner is already running"),
            StartError::Finished(status) => {
                write!(f, "runner already finished ({status}); create a new runner")
            }
            StartError::Spawn(err) => write!(f, "failed to spawn runner thread: {err}"),
        }
    }
}

impl std::error::Error for StartError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StartError::Spawn(err) => Some(err),
            _ => None,
        }
    }
}

/// Point-in-time view of a runner for polling callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunnerSnapshot {
    pub status: RunnerStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    pub waiting: Option<WaitInfo>,
    pub paused: bool,
    pub pause_pending: bool,
    pub missing_checkpoint: bool,
    pub error: Option<String>,
    pub invocations: u32,
    pub waits: WaitTally,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WaitInfo {
    pub reason: WaitReason,
    pub seconds_remaining: u64,
}

/// State shared between the worker and command callers.
#[derive(Debug)]
struct Control {
    status: RunnerStatus,
    attempt: u32,
    error: Option<String>,
    wait: WaitTracker,
    pause_requested: bool,
    paused: bool,
    missing_checkpoint: bool,
    decision: Option<CheckpointDecision>,
    stop_requested: bool,
    invocations: u32,
    waits: WaitTally,
}

impl Control {
    fn new() -> Self {
        Self {
            status: RunnerStatus::Pending,
            attempt: 0,
            error: None,
            wait: WaitTracker::default(),
            pause_requested: false,
            paused: false,
            missing_checkpoint: false,
            decision: None,
            stop_requested: false,
            invocations: 0,
            waits: WaitTally::default(),
        }
    }

    /// Apply `next` if it is a legal edge.
    ///
    /// Returns `Ok(false)` when the runner is already terminal (e.g. force
    /// killed from another thread); terminal states absorb everything.
    fn set_status(&mut self, next: RunnerStatus) -> Result<bool> {
        if self.status.is_terminal() {
            return Ok(false);
        }
        if !self.status.can_transition_to(next) {
            return Err(anyhow!(
                "invalid status transition {} -> {}",
                self.status,
                next
            ));
        }
        self.status = next;
        if next.is_terminal() {
            self.wait.exit();
            self.paused = false;
            self.pause_requested = false;
            self.missing_checkpoint = false;
        }
        Ok(true)
    }

    /// Enter `MissingCheckpoint` and accept decisions. A runner that was
    /// stopped concurrently stays closed.
    fn open_checkpoint_gate(&mut self) -> Result<bool> {
        self.decision = None;
        if !self.set_status(RunnerStatus::MissingCheckpoint)? {
            return Ok(false);
        }
        self.missing_checkpoint = true;
        Ok(true)
    }

    fn halted(&self) -> bool {
        self.stop_requested || self.status.is_terminal()
    }
}

/// Whether the loop should go on to the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Next,
    Finished,
}

struct Shared {
    dir: PathBuf,
    params: InvocationParams,
    options: RunnerOptions,
    templates: Templates,
    sentinels: Arc<dyn SentinelStore>,
    invoker: Arc<dyn Invoker>,
    control: Mutex<Control>,
    signal: Condvar,
    /// The only live agent, if any. Whoever takes it out owns terminating it.
    child: Mutex<Option<Box<dyn AgentHandle>>>,
}

/// Builder for [`LoopRunner`]; defaults to the real filesystem and CLI agent.
pub struct RunnerBuilder {
    dir: PathBuf,
    params: InvocationParams,
    options: RunnerOptions,
    templates: Option<Templates>,
    sentinels: Option<Arc<dyn SentinelStore>>,
    invoker: Option<Arc<dyn Invoker>>,
}

impl RunnerBuilder {
    pub fn options(mut self, options: RunnerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn templates(mut self, templates: Templates) -> Self {
        self.templates = Some(templates);
        self
    }

    pub fn sentinels(mut self, sentinels: Arc<dyn SentinelStore>) -> Self {
        self.sentinels = Some(sentinels);
        self
    }

    pub fn invoker(mut self, invoker: Arc<dyn Invoker>) -> Self {
        self.invoker = Some(invoker);
        self
    }

    pub fn build(self) -> LoopRunner {
        let sentinels = self
            .sentinels
            .unwrap_or_else(|| Arc::new(FsSentinels::new(&self.dir)));
        let invoker = self
            .invoker
            .unwrap_or_else(|| Arc::new(CliInvoker::new("opencode")));
        LoopRunner {
            shared: Arc::new(Shared {
                dir: self.dir,
                params: self.params,
                options: self.options,
                templates: self.templates.unwrap_or_else(Templates::builtin),
                sentinels,
                invoker,
                control: Mutex::new(Control::new()),
                signal: Condvar::new(),
                child: Mutex::new(None),
            }),
            thread: Mutex::new(None),
        }
    }
}

/// Supervises repeated agent invocations against one directory.
pub struct LoopRunner {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for LoopRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopRunner")
            .field("dir", &self.shared.dir)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl LoopRunner {
    pub fn builder(dir: impl Into<PathBuf>, params: InvocationParams) -> RunnerBuilder {
        RunnerBuilder {
            dir: dir.into(),
            params,
            options: RunnerOptions::default(),
            templates: None,
            sentinels: None,
            invoker: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.shared.dir
    }

    pub fn params(&self) -> &InvocationParams {
        &self.shared.params
    }

    pub fn max_attempts(&self) -> u32 {
        self.shared.options.max_attempts
    }

    /// Launch the loop on its own thread. A runner can only be started once.
    pub fn start(&self) -> Result<(), StartError> {
        let mut thread = lock(&self.thread);
        if thread.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(StartError::AlreadyRunning);
        }
        {
            let mut control = self.shared.lock();
            match control.status {
                RunnerStatus::Pending => {}
                status if status.is_terminal() => return Err(StartError::Finished(status)),
                _ => return Err(StartError::AlreadyRunning),
            }
            control.stop_requested = false;
            control.status = RunnerStatus::Running;
        }

        let shared = Arc::clone(&self.shared);
        let name = format!(
            "supervise-{}",
            self.shared
                .dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        );
        match thread::Builder::new().name(name).spawn(move || shared.run()) {
            Ok(handle) => {
                *thread = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.shared
                    .finish_failed(format!("failed to spawn runner thread: {err}"));
                Err(StartError::Spawn(err))
            }
        }
    }

    /// Request a graceful stop, honored at the next suspension point.
    pub fn stop(&self) {
        self.shared.request_stop();
    }

    /// Queue a pause for the next attempt boundary. No-op while already paused.
    pub fn pause(&self) {
        let mut control = self.shared.lock();
        if control.paused || control.status.is_terminal() {
            return;
        }
        control.pause_requested = true;
        debug!(dir = %self.shared.dir.display(), "pause queued");
    }

    /// Leave the paused state, or cancel a queued pause.
    pub fn resume(&self) {
        let mut control = self.shared.lock();
        control.paused = false;
        control.pause_requested = false;
        self.shared.signal.notify_all();
    }

    pub fn continue_after_missing_checkpoint(&self) {
        self.decide(CheckpointDecision::Continue);
    }

    pub fn stop_after_missing_checkpoint(&self) {
        self.decide(CheckpointDecision::Stop);
    }

    fn decide(&self, decision: CheckpointDecision) {
        let mut control = self.shared.lock();
        if !control.missing_checkpoint {
            debug!(?decision, "no missing-checkpoint decision pending; ignored");
            return;
        }
        control.decision = Some(decision);
        control.missing_checkpoint = false;
        self.shared.signal.notify_all();
    }

    /// Kill the agent process tree now and mark the run stopped.
    pub fn force_kill(&self) {
        self.shared.force_kill();
    }

    /// Cloneable stop/kill access for other threads, such as a signal handler.
    pub fn handle(&self) -> RunnerHandle {
        RunnerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Block until the worker thread exits. Returns immediately if never started.
    pub fn join(&self) {
        let handle = lock(&self.thread).take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            error!(dir = %self.shared.dir.display(), "runner thread panicked");
        }
    }

    pub fn status(&self) -> RunnerStatus {
        self.shared.lock().status
    }

    pub fn current_attempt(&self) -> u32 {
        self.shared.lock().attempt
    }

    /// Whether the worker thread is alive.
    pub fn is_running(&self) -> bool {
        lock(&self.thread)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    pub fn is_waiting(&self) -> bool {
        self.shared.lock().wait.is_waiting()
    }

    pub fn waiting_reason(&self) -> Option<WaitReason> {
        self.shared.lock().wait.reason()
    }

    pub fn waiting_seconds_remaining(&self) -> u64 {
        self.shared.lock().wait.seconds_remaining()
    }

    pub fn is_paused(&self) -> bool {
        self.shared.lock().paused
    }

    pub fn pause_pending(&self) -> bool {
        self.shared.lock().pause_requested
    }

    pub fn is_missing_checkpoint_pause(&self) -> bool {
        self.shared.lock().missing_checkpoint
    }

    pub fn error_message(&self) -> Option<String> {
        self.shared.lock().error.clone()
    }

    /// Whether an agent process is currently held by this runner.
    pub fn has_live_child(&self) -> bool {
        lock(&self.shared.child).is_some()
    }

    pub fn snapshot(&self) -> RunnerSnapshot {
        let control = self.shared.lock();
        RunnerSnapshot {
            status: control.status,
            attempt: control.attempt,
            max_attempts: self.shared.options.max_attempts,
            waiting: control.wait.current().map(|w| WaitInfo {
                reason: w.reason,
                seconds_remaining: w.seconds_remaining_at(Instant::now()),
            }),
            paused: control.paused,
            pause_pending: control.pause_requested,
            missing_checkpoint: control.missing_checkpoint,
            error: control.error.clone(),
            invocations: control.invocations,
            waits: control.waits,
        }
    }
}

impl Drop for LoopRunner {
    fn drop(&mut self) {
        // The worker holds its own reference to the shared state; tell it to wind down.
        if lock(&self.shared.child).is_some() {
            self.force_kill();
        } else {
            self.stop();
        }
    }
}

/// Stop and kill access to a runner that outlives borrows of the [`LoopRunner`].
#[derive(Clone)]
pub struct RunnerHandle {
    shared: Arc<Shared>,
}

impl fmt::Debug for RunnerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerHandle")
            .field("dir", &self.shared.dir)
            .finish_non_exhaustive()
    }
}

impl RunnerHandle {
    pub fn stop(&self) {
        self.shared.request_stop();
    }

    pub fn force_kill(&self) {
        self.shared.force_kill();
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Control> {
        lock(&self.control)
    }

    fn request_stop(&self) {
        let mut control = self.lock();
        if !control.stop_requested {
            info!(dir = %self.dir.display(), "stop requested");
        }
        control.stop_requested = true;
        self.signal.notify_all();
    }

    fn force_kill(&self) {
        let handle = lock(&self.child).take();
        if let Some(mut handle) = handle {
            warn!(pid = ?handle.id(), dir = %self.dir.display(), "force killing agent");
            if let Err(err) = handle.kill() {
                warn!(err = %format!("{err:#}"), "kill failed");
            }
            match handle.wait_timeout(self.options.kill_grace) {
                Ok(Some(_)) => {}
                Ok(None) => warn!(pid = ?handle.id(), "agent still running after kill"),
                Err(err) => warn!(err = %format!("{err:#}"), "reap after kill failed"),
            }
        }

        let mut control = self.lock();
        control.stop_requested = true;
        control.wait.exit();
        control.paused = false;
        control.pause_requested = false;
        control.missing_checkpoint = false;
        if control.status != RunnerStatus::Pending {
            // Absorbed when already terminal; every active state may stop.
            let _ = control.set_status(RunnerStatus::Stopped);
        }
        self.signal.notify_all();
    }

    /// Wait on the control condvar for at most `timeout` while `keep_waiting` holds.
    fn wait_while<'a>(
        &self,
        guard: MutexGuard<'a, Control>,
        timeout: Duration,
        keep_waiting: impl FnMut(&mut Control) -> bool,
    ) -> MutexGuard<'a, Control> {
        let (guard, _) = self
            .signal
            .wait_timeout_while(guard, timeout, keep_waiting)
            .unwrap_or_else(PoisonError::into_inner);
        guard
    }

    /// Worker entry point. Every exit path leaves the runner terminal.
    fn run(self: Arc<Self>) {
        let span = info_span!("supervise", dir = %self.dir.display());
        let _enter = span.enter();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run_loop()));
        let message = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(format!("{err:#}")),
            Err(payload) => Some(panic_message(payload.as_ref())),
        };
        if let Some(message) = message {
            error!(err = %message, "loop error");
            self.finish_failed(message);
        }
        self.kill_leftover_child();

        let control = self.lock();
        if !control.status.is_terminal() {
            drop(control);
            self.finish_failed("loop ended without a terminal status".to_string());
        } else {
            info!(
                status = %control.status,
                attempt = control.attempt,
                waits = control.waits.total(),
                "loop finished"
            );
        }
    }

    fn run_loop(&self) -> Result<()> {
        if !self.sentinels.exists(Sentinel::Design)? {
            error!(file = Sentinel::Design.file_name(), "required design spec missing");
            self.finish_failed(format!("missing {}", Sentinel::Design.file_name()));
            return Ok(());
        }

        scaffold_if_absent(&*self.sentinels, Sentinel::Plan, &self.templates.plan)?;
        scaffold_if_absent(&*self.sentinels, Sentinel::Progress, &self.templates.progress)?;

        // Terminal markers from a previous run must not end this one.
        self.sentinels.remove(Sentinel::Done)?;
        self.sentinels.remove(Sentinel::Blocked)?;

        info!(model = %self.params.model, max_attempts = self.options.max_attempts, "loop started");

        for attempt in 1..=self.options.max_attempts {
            if self.attempt(attempt)? == Flow::Finished {
                return Ok(());
            }
        }

        warn!("max attempts reached without completion");
        self.finish_failed("max attempts reached".to_string());
        Ok(())
    }

    fn attempt(&self, attempt: u32) -> Result<Flow> {
        {
            let mut control = self.lock();
            if control.status.is_terminal() {
                return Ok(Flow::Finished);
            }
            control.attempt = attempt;
        }
        info!(attempt, max_attempts = self.options.max_attempts, "attempt");

        if self.pause_boundary()? == Flow::Finished {
            return Ok(Flow::Finished);
        }

        let stop_requested = self.lock().stop_requested;
        if stop_requested || self.sentinels.exists(Sentinel::Stop)? {
            info!("stop requested");
            return self.finish(RunnerStatus::Stopped);
        }

        if let Some(status) = self.terminal_sentinel()? {
            return self.finish(status);
        }

        if consume_checkpoint(&*self.sentinels)? {
            info!("checkpoint present before invocation; restarting fresh");
            return self.wait(WaitReason::Checkpoint);
        }

        match self.invoke(attempt)? {
            InvocationOutcome::Succeeded => {}
            InvocationOutcome::Interrupted => {
                info!("agent interrupted by stop");
                return self.finish(RunnerStatus::Stopped);
            }
            failed => {
                let message = failed.error_message();
                warn!(err = ?message, "agent invocation failed; backing off");
                if let Some(message) = message {
                    self.lock().error = Some(message);
                }
                return self.wait(WaitReason::Backoff);
            }
        }

        if let Some(status) = self.terminal_sentinel()? {
            return self.finish(status);
        }

        if consume_checkpoint(&*self.sentinels)? {
            info!("checkpoint found after invocation; continuing");
            return self.wait(WaitReason::Checkpoint);
        }

        self.missing_checkpoint_gate()
    }

    /// Done or blocked, with any checkpoint alongside consumed. Done wins.
    fn terminal_sentinel(&self) -> Result<Option<RunnerStatus>> {
        let status = if self.sentinels.exists(Sentinel::Done)? {
            RunnerStatus::Completed
        } else if self.sentinels.exists(Sentinel::Blocked)? {
            RunnerStatus::Blocked
        } else {
            return Ok(None);
        };
        if consume_checkpoint(&*self.sentinels)? {
            info!(%status, "removed checkpoint; terminal sentinel takes precedence");
        }
        match status {
            RunnerStatus::Blocked => {
                info!(file = Sentinel::Blocked.file_name(), "blocked");
            }
            _ => info!("done"),
        }
        Ok(Some(status))
    }

    fn pause_boundary(&self) -> Result<Flow> {
        let mut control = self.lock();
        if !control.pause_requested {
            return Ok(Flow::Next);
        }
        control.pause_requested = false;
        control.paused = true;
        control.set_status(RunnerStatus::Paused)?;
        info!("paused at attempt boundary");

        while control.paused && !control.halted() {
            control = self.wait_while(control, Duration::from_secs(60), |c| {
                c.paused && !c.halted()
            });
        }
        control.paused = false;

        if control.status.is_terminal() {
            return Ok(Flow::Finished);
        }
        if control.stop_requested {
            info!("stop requested while paused");
            control.set_status(RunnerStatus::Stopped)?;
            return Ok(Flow::Finished);
        }
        control.set_status(RunnerStatus::Running)?;
        info!("resumed");
        Ok(Flow::Next)
    }

    /// Interruptible wait, then back to running for the next attempt.
    fn wait(&self, reason: WaitReason) -> Result<Flow> {
        let mut control = self.lock();
        if !control.set_status(RunnerStatus::Waiting(reason))? {
            return Ok(Flow::Finished);
        }
        let wait = control.wait.enter(reason, self.options.delay);
        debug!(%reason, delay_ms = self.options.delay.as_millis(), "waiting");

        while !control.halted() {
            let now = Instant::now();
            if wait.is_elapsed_at(now) {
                break;
            }
            control = self.wait_while(control, wait.remaining_at(now), |c| !c.halted());
        }
        control.wait.exit();
        control.waits.record(reason);

        if control.status.is_terminal() {
            return Ok(Flow::Finished);
        }
        if control.stop_requested {
            info!(%reason, "stop requested while waiting");
            control.set_status(RunnerStatus::Stopped)?;
            return Ok(Flow::Finished);
        }
        control.set_status(RunnerStatus::Running)?;
        Ok(Flow::Next)
    }

    fn missing_checkpoint_gate(&self) -> Result<Flow> {
        let mut control = self.lock();
        if !control.open_checkpoint_gate()? {
            return Ok(Flow::Finished);
        }
        warn!(
            file = Sentinel::Checkpoint.file_name(),
            "no checkpoint created; waiting for operator decision"
        );

        while control.decision.is_none() && !control.halted() {
            control = self.wait_while(control, Duration::from_secs(60), |c| {
                c.decision.is_none() && !c.halted()
            });
        }
        control.missing_checkpoint = false;
        let decision = control.decision.take();

        if control.status.is_terminal() {
            return Ok(Flow::Finished);
        }
        if control.stop_requested {
            info!("stop requested while waiting for checkpoint decision");
            control.set_status(RunnerStatus::Stopped)?;
            return Ok(Flow::Finished);
        }
        match decision {
            Some(CheckpointDecision::Continue) => {
                info!("operator chose to continue after missing checkpoint");
                control.set_status(RunnerStatus::Running)?;
                drop(control);
                self.wait(WaitReason::Cooldown)
            }
            Some(CheckpointDecision::Stop) | None => {
                info!("operator chose to stop after missing checkpoint");
                control.set_status(RunnerStatus::Stopped)?;
                Ok(Flow::Finished)
            }
        }
    }

    /// Launch the agent and block until it exits or a stop arrives.
    fn invoke(&self, attempt: u32) -> Result<InvocationOutcome> {
        let request = InvokeRequest {
            workdir: &self.dir,
            prompt: self.templates.prompt(),
            params: &self.params,
            attempt,
        };
        info!(attempt, "invoking agent");
        let handle = match self.invoker.launch(&request) {
            Ok(handle) => handle,
            Err(err) => {
                return Ok(InvocationOutcome::LaunchFailed {
                    message: format!("{err:#}"),
                });
            }
        };
        {
            let mut slot = lock(&self.child);
            if let Some(mut stale) = slot.replace(handle) {
                // Unreachable while the worker is the only launcher; never keep two alive.
                warn!(pid = ?stale.id(), "replacing live agent handle; killing it");
                let _ = stale.kill();
            }
        }
        self.lock().invocations += 1;

        loop {
            match self.poll_child() {
                Ok(ChildPoll::Exited(exit)) => {
                    if exit.success() {
                        return Ok(InvocationOutcome::Succeeded);
                    }
                    warn!(exit_code = ?exit.code, "agent returned non-zero");
                    return Ok(InvocationOutcome::Exited { code: exit.code });
                }
                Ok(ChildPoll::Gone) => return Ok(InvocationOutcome::Interrupted),
                Ok(ChildPoll::Running) => {}
                Err(err) => {
                    self.kill_leftover_child();
                    return Err(err);
                }
            }

            let control = self.lock();
            let control = self.wait_while(control, self.options.poll_interval, |c| !c.halted());
            if control.halted() {
                drop(control);
                self.stop_child();
                return Ok(InvocationOutcome::Interrupted);
            }
        }
    }

    fn poll_child(&self) -> Result<ChildPoll> {
        let mut slot = lock(&self.child);
        let Some(child) = slot.as_mut() else {
            // Taken by force_kill.
            return Ok(ChildPoll::Gone);
        };
        match child.try_wait().context("poll agent")? {
            Some(exit) => {
                slot.take();
                Ok(ChildPoll::Exited(exit))
            }
            None => Ok(ChildPoll::Running),
        }
    }

    /// Graceful terminate with a bounded wait, escalating to kill.
    ///
    /// The handle stays in the slot while waiting so a concurrent force kill
    /// can still reach it.
    fn stop_child(&self) {
        {
            let mut slot = lock(&self.child);
            let Some(child) = slot.as_mut() else {
                return;
            };
            info!(pid = ?child.id(), "terminating agent");
            if let Err(err) = child.request_terminate() {
                warn!(err = %format!("{err:#}"), "terminate failed");
            }
        }

        let deadline = Instant::now() + self.options.stop_grace;
        loop {
            match self.poll_child() {
                Ok(ChildPoll::Exited(_) | ChildPoll::Gone) => return,
                Ok(ChildPoll::Running) => {}
                Err(err) => {
                    warn!(err = %format!("{err:#}"), "poll during terminate failed");
                    break;
                }
            }
            if Instant::now() >= deadline {
                warn!("agent ignored terminate within grace period; killing");
                break;
            }
            thread::sleep(self.options.poll_interval.min(Duration::from_millis(100)));
        }
        self.kill_leftover_child();
    }

    /// Force kill whatever agent is still held. Used on error paths and at loop exit.
    fn kill_leftover_child(&self) {
        let handle = lock(&self.child).take();
        if let Some(mut handle) = handle {
            if let Ok(Some(_)) = handle.try_wait() {
                return;
            }
            warn!(pid = ?handle.id(), "killing leftover agent");
            if let Err(err) = handle.kill() {
                warn!(err = %format!("{err:#}"), "kill failed");
            }
            let _ = handle.wait_timeout(self.options.kill_grace);
        }
    }

    fn finish(&self, status: RunnerStatus) -> Result<Flow> {
        self.lock().set_status(status)?;
        Ok(Flow::Finished)
    }

    fn finish_failed(&self, message: String) {
        let mut control = self.lock();
        if control.status.is_terminal() {
            return;
        }
        control.error = Some(message);
        if let Err(err) = control.set_status(RunnerStatus::Failed) {
            error!(err = %err, "cannot mark runner failed");
        }
        self.signal.notify_all();
    }
}

enum ChildPoll {
    Running,
    Exited(crate::io::process::AgentExit),
    Gone,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("loop panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("loop panicked: {s}")
    } else {
        "loop panicked".to_string()
    }
}
