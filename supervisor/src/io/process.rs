//! Child process handles for the agent.
//!
//! The agent may spawn its own subprocesses, so on unix every agent is started
//! as the leader of a fresh process group and signals are delivered to the
//! whole group.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::debug;
use wait_timeout::ChildExt;

/// How an agent process exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentExit {
    /// Exit code, or `None` when the process was ended by a signal.
    pub code: Option<i32>,
}

impl AgentExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for AgentExit {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

/// Control over one running agent process.
pub trait AgentHandle: Send {
    fn id(&self) -> Option<u32>;

    /// Non-blocking check for exit.
    fn try_wait(&mut self) -> Result<Option<AgentExit>>;

    /// Block up to `timeout` for exit.
    fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<AgentExit>>;

    /// Ask the process tree to shut down (SIGTERM on unix). Does not wait.
    fn request_terminate(&mut self) -> Result<()>;

    /// Kill the process tree immediately. Does not wait.
    fn kill(&mut self) -> Result<()>;
}

/// Real agent process started with [`spawn_agent`].
#[derive(Debug)]
pub struct ChildHandle {
    child: Child,
    exit: Option<AgentExit>,
}

impl ChildHandle {
    fn record(&mut self, status: Option<ExitStatus>) -> Option<AgentExit> {
        if let Some(status) = status {
            let exit = AgentExit::from(status);
            debug!(pid = self.child.id(), exit_code = ?exit.code, "agent exited");
            self.exit = Some(exit);
        }
        self.exit
    }
}

impl AgentHandle for ChildHandle {
    fn id(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn try_wait(&mut self) -> Result<Option<AgentExit>> {
        if self.exit.is_some() {
            return Ok(self.exit);
        }
        let status = self.child.try_wait().context("poll agent process")?;
        Ok(self.record(status))
    }

    fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<AgentExit>> {
        if self.exit.is_some() {
            return Ok(self.exit);
        }
        let status = self
            .child
            .wait_timeout(timeout)
            .context("wait for agent process")?;
        Ok(self.record(status))
    }

    fn request_terminate(&mut self) -> Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        signal_tree(&mut self.child, TreeSignal::Terminate)
    }

    fn kill(&mut self) -> Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        signal_tree(&mut self.child, TreeSignal::Kill)
    }
}

/// Spawn `cmd` as a new process group leader in `workdir`.
///
/// Output goes to the inherited terminal, or is appended to `output_log` when set.
pub fn spawn_agent(
    mut cmd: Command,
    workdir: &Path,
    output_log: Option<&Path>,
) -> std::io::Result<ChildHandle> {
    cmd.current_dir(workdir).stdin(Stdio::null());
    if let Some(path) = output_log {
        let file = open_log(path)?;
        let err_file = file.try_clone()?;
        cmd.stdout(Stdio::from(file)).stderr(Stdio::from(err_file));
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    let child = cmd.spawn()?;
    debug!(pid = child.id(), "spawned agent process");
    Ok(ChildHandle { child, exit: None })
}

fn open_log(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

#[derive(Debug, Clone, Copy)]
enum TreeSignal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_tree(child: &mut Child, signal: TreeSignal) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let sig = match signal {
        TreeSignal::Terminate => Signal::SIGTERM,
        TreeSignal::Kill => Signal::SIGKILL,
    };
    let pgid = Pid::from_raw(i32::try_from(child.id()).context("agent pid out of range")?);
    match killpg(pgid, sig) {
        Ok(()) => {
            debug!(pgid = pgid.as_raw(), signal = ?sig, "signalled agent process group");
            Ok(())
        }
        // Group already gone; fall back to the direct child in case it was reparented.
        Err(Errno::ESRCH) => match signal {
            TreeSignal::Kill => kill_direct(child),
            TreeSignal::Terminate => Ok(()),
        },
        Err(err) => Err(err).with_context(|| format!("signal process group {pgid}")),
    }
}

#[cfg(windows)]
fn signal_tree(child: &mut Child, _signal: TreeSignal) -> Result<()> {
    // No graceful tree signal on Windows; taskkill /T takes the descendants too.
    let status = Command::new("taskkill")
        .args(["/T", "/F", "/PID", &child.id().to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match status {
        Ok(status) if status.success() => Ok(()),
        _ => kill_direct(child),
    }
}

fn kill_direct(child: &mut Child) -> Result<()> {
    match child.kill() {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
        Err(err) => Err(err).context("kill agent process"),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::test_support::wait_for;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn reports_exit_codes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut ok = spawn_agent(sh("exit 0"), temp.path(), None).expect("spawn");
        let exit = ok
            .wait_timeout(Duration::from_secs(10))
            .expect("wait")
            .expect("exited");
        assert!(exit.success());

        let mut bad = spawn_agent(sh("exit 3"), temp.path(), None).expect("spawn");
        let exit = bad
            .wait_timeout(Duration::from_secs(10))
            .expect("wait")
            .expect("exited");
        assert_eq!(exit.code, Some(3));
        assert!(!exit.success());
    }

    #[test]
    fn runs_in_workdir_and_appends_output_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("logs/agent.log");
        let mut child =
            spawn_agent(sh("pwd; echo oops >&2"), temp.path(), Some(&log)).expect("spawn");
        child
            .wait_timeout(Duration::from_secs(10))
            .expect("wait")
            .expect("exited");

        let contents = std::fs::read_to_string(&log).expect("read log");
        let dir_name = temp
            .path()
            .file_name()
            .and_then(|n| n.to_str())
            .expect("dir name");
        assert!(contents.contains(dir_name));
        assert!(contents.contains("oops"));
    }

    #[test]
    fn terminate_stops_a_sleeping_agent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut child = spawn_agent(sh("sleep 30"), temp.path(), None).expect("spawn");
        assert!(child.try_wait().expect("poll").is_none());

        let started = Instant::now();
        child.request_terminate().expect("terminate");
        let exit = child
            .wait_timeout(Duration::from_secs(5))
            .expect("wait")
            .expect("exited after terminate");
        assert_eq!(exit.code, None);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn kill_ends_the_whole_group() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut child = spawn_agent(
            sh("sleep 30 & echo $! > grandchild.pid; sleep 30 & wait"),
            temp.path(),
            None,
        )
        .expect("spawn");
        let pid_file = temp.path().join("grandchild.pid");
        let mut grandchild = None;
        assert!(wait_for(Duration::from_secs(5), || {
            grandchild = std::fs::read_to_string(&pid_file)
                .ok()
                .and_then(|raw| raw.trim().parse::<i32>().ok());
            grandchild.is_some()
        }));
        let grandchild = grandchild.expect("grandchild pid");
        assert!(process_alive(grandchild));

        child.kill().expect("kill");
        let exit = child
            .wait_timeout(Duration::from_secs(5))
            .expect("wait")
            .expect("child exited");
        assert_eq!(exit.code, None);
        assert!(
            wait_for(Duration::from_secs(5), || !process_alive(grandchild)),
            "grandchild {grandchild} survived the group kill"
        );
        // A second kill after exit is a no-op.
        child.kill().expect("kill again");
    }

    fn process_alive(pid: i32) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        match kill(Pid::from_raw(pid), None) {
            Err(Errno::ESRCH) => false,
            // Orphaned zombies answer signals until init reaps them.
            _ => !std::fs::read_to_string(format!("/proc/{pid}/stat"))
                .is_ok_and(|stat| stat.contains(") Z")),
        }
    }
}
