//! Test doubles for driving the loop runner without real agents.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::core::types::InvocationParams;
use crate::io::invoker::{InvokeRequest, Invoker};
use crate::io::process::{AgentExit, AgentHandle};
use crate::io::sentinel::{Sentinel, SentinelStore};
use crate::runner::{LoopRunner, RunnerOptions};

/// In-memory sentinel store with optional fault injection.
#[derive(Debug, Default)]
pub struct MemorySentinels {
    files: Mutex<HashMap<Sentinel, String>>,
    failing: Mutex<HashSet<Sentinel>>,
}

impl MemorySentinels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that already holds a design spec.
    pub fn with_design() -> Self {
        let store = Self::new();
        store.insert(Sentinel::Design, "# Design\n");
        store
    }

    pub fn insert(&self, sentinel: Sentinel, contents: &str) {
        self.files
            .lock()
            .unwrap()
            .insert(sentinel, contents.to_string());
    }

    pub fn contains(&self, sentinel: Sentinel) -> bool {
        self.files.lock().unwrap().contains_key(&sentinel)
    }

    pub fn contents(&self, sentinel: Sentinel) -> Option<String> {
        self.files.lock().unwrap().get(&sentinel).cloned()
    }

    /// Make every operation on `sentinel` return an I/O error.
    pub fn fail_on(&self, sentinel: Sentinel) {
        self.failing.lock().unwrap().insert(sentinel);
    }

    fn check(&self, sentinel: Sentinel) -> Result<()> {
        if self.failing.lock().unwrap().contains(&sentinel) {
            return Err(anyhow!("injected failure on {}", sentinel.file_name()));
        }
        Ok(())
    }
}

impl SentinelStore for MemorySentinels {
    fn exists(&self, sentinel: Sentinel) -> Result<bool> {
        self.check(sentinel)?;
        Ok(self.contains(sentinel))
    }

    fn remove(&self, sentinel: Sentinel) -> Result<bool> {
        self.check(sentinel)?;
        Ok(self.files.lock().unwrap().remove(&sentinel).is_some())
    }

    fn read(&self, sentinel: Sentinel) -> Result<Option<String>> {
        self.check(sentinel)?;
        Ok(self.contents(sentinel))
    }

    fn write(&self, sentinel: Sentinel, contents: &str) -> Result<()> {
        self.check(sentinel)?;
        self.insert(sentinel, contents);
        Ok(())
    }
}

/// One scripted agent session.
#[derive(Debug, Clone, Default)]
pub struct ScriptedRun {
    /// Sentinels the "agent" creates while it runs.
    pub creates: Vec<Sentinel>,
    pub exit_code: i32,
    /// Fail the launch with this message instead of running.
    pub launch_error: Option<String>,
    /// Keep running until released, terminated or killed.
    pub hold: bool,
    /// Ignore graceful terminate; only kill ends it.
    pub ignore_terminate: bool,
    /// Panic inside `launch`.
    pub panic: bool,
}

impl ScriptedRun {
    pub fn exit(code: i32) -> Self {
        Self {
            exit_code: code,
            ..Self::default()
        }
    }

    pub fn ok() -> Self {
        Self::exit(0)
    }

    pub fn launch_error(message: &str) -> Self {
        Self {
            launch_error: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn held() -> Self {
        Self {
            hold: true,
            ..Self::default()
        }
    }

    pub fn panicking() -> Self {
        Self {
            panic: true,
            ..Self::default()
        }
    }

    pub fn creating(mut self, sentinel: Sentinel) -> Self {
        self.creates.push(sentinel);
        self
    }

    pub fn ignoring_terminate(mut self) -> Self {
        self.ignore_terminate = true;
        self
    }
}

/// What the invoker saw for one launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub attempt: u32,
    pub prompt: String,
    pub params: InvocationParams,
}

#[derive(Debug, Default)]
struct Gate {
    released: Mutex<bool>,
    signal: Condvar,
}

/// Invoker that replays [`ScriptedRun`]s in order. An exhausted script fails the launch.
pub struct ScriptedInvoker {
    sentinels: Arc<dyn SentinelStore>,
    script: Mutex<VecDeque<ScriptedRun>>,
    requests: Mutex<Vec<RecordedRequest>>,
    live: Arc<AtomicUsize>,
    max_live: Arc<AtomicUsize>,
    gate: Arc<Gate>,
}

impl ScriptedInvoker {
    pub fn new(sentinels: Arc<dyn SentinelStore>, runs: Vec<ScriptedRun>) -> Self {
        Self {
            sentinels,
            script: Mutex::new(runs.into()),
            requests: Mutex::new(Vec::new()),
            live: Arc::new(AtomicUsize::new(0)),
            max_live: Arc::new(AtomicUsize::new(0)),
            gate: Arc::new(Gate::default()),
        }
    }

    pub fn push(&self, run: ScriptedRun) {
        self.script.lock().unwrap().push_back(run);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn launches(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Handles that have not exited yet.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously live handles ever observed.
    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    /// Let every held run exit with its scripted code.
    pub fn release(&self) {
        *self.gate.released.lock().unwrap() = true;
        self.gate.signal.notify_all();
    }
}

impl Invoker for ScriptedInvoker {
    fn launch(&self, request: &InvokeRequest<'_>) -> Result<Box<dyn AgentHandle>> {
        self.requests.lock().unwrap().push(RecordedRequest {
            attempt: request.attempt,
            prompt: request.prompt.to_string(),
            params: request.params.clone(),
        });
        let run = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow!("script exhausted"))?;
        if run.panic {
            panic!("scripted agent panic");
        }
        if let Some(message) = run.launch_error {
            return Err(anyhow!(message));
        }
        for &sentinel in &run.creates {
            self.sentinels.write(sentinel, "")?;
        }

        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(live, Ordering::SeqCst);
        let mut handle = ScriptedHandle {
            exit_code: run.exit_code,
            hold: run.hold,
            ignore_terminate: run.ignore_terminate,
            exit: None,
            live: Arc::clone(&self.live),
            gate: Arc::clone(&self.gate),
        };
        if !run.hold {
            handle.finish(Some(run.exit_code));
        }
        Ok(Box::new(handle))
    }
}

struct ScriptedHandle {
    exit_code: i32,
    hold: bool,
    ignore_terminate: bool,
    exit: Option<AgentExit>,
    live: Arc<AtomicUsize>,
    gate: Arc<Gate>,
}

impl ScriptedHandle {
    fn finish(&mut self, code: Option<i32>) {
        if self.exit.is_none() {
            self.exit = Some(AgentExit { code });
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn poll(&mut self) -> Option<AgentExit> {
        if self.exit.is_none() && self.hold && *self.gate.released.lock().unwrap() {
            self.finish(Some(self.exit_code));
        }
        self.exit
    }
}

impl AgentHandle for ScriptedHandle {
    fn id(&self) -> Option<u32> {
        None
    }

    fn try_wait(&mut self) -> Result<Option<AgentExit>> {
        Ok(self.poll())
    }

    fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<AgentExit>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(exit) = self.poll() {
                return Ok(Some(exit));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let released = self.gate.released.lock().unwrap();
            let _ = self
                .gate
                .signal
                .wait_timeout(released, (deadline - now).min(Duration::from_millis(10)))
                .unwrap();
        }
    }

    fn request_terminate(&mut self) -> Result<()> {
        if !self.ignore_terminate {
            self.finish(None);
        }
        Ok(())
    }

    fn kill(&mut self) -> Result<()> {
        self.finish(None);
        Ok(())
    }
}

/// Options with short waits so loop tests finish quickly.
pub fn fast_options(max_attempts: u32) -> RunnerOptions {
    RunnerOptions {
        max_attempts,
        delay: Duration::from_millis(30),
        poll_interval: Duration::from_millis(10),
        stop_grace: Duration::from_millis(300),
        kill_grace: Duration::from_millis(300),
    }
}

/// Runner over an in-memory store and scripted invoker.
pub fn scripted_runner(
    sentinels: &Arc<MemorySentinels>,
    invoker: &Arc<ScriptedInvoker>,
    options: RunnerOptions,
) -> LoopRunner {
    let store: Arc<dyn SentinelStore> = sentinels.clone();
    let agent: Arc<dyn Invoker> = invoker.clone();
    LoopRunner::builder("/supervised", InvocationParams::new("test/model"))
        .options(options)
        .sentinels(store)
        .invoker(agent)
        .build()
}

/// Poll `condition` every few milliseconds until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

/// Wait up to `timeout` for the runner's worker to exit, then join it.
pub fn join_within(runner: &LoopRunner, timeout: Duration) -> bool {
    let finished = wait_for(timeout, || !runner.is_running());
    if finished {
        runner.join();
    }
    finished
}

/// Temporary directory holding a design spec.
pub fn design_dir() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    write_design(dir.path());
    dir
}

pub fn write_design(dir: &Path) {
    fs::write(dir.join(Sentinel::Design.file_name()), "# Design\n").unwrap();
}
