//! Terminal signals for `supervisor run`.
//!
//! Agents run in their own process groups, so Ctrl-C at the terminal never
//! reaches them. The first SIGINT/SIGTERM/SIGHUP asks every runner to stop,
//! which terminates its agent and lets the control loop drain. Any further
//! signal force kills what is left.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context, Result};
use tracing::warn;

use crate::runner::RunnerHandle;

#[derive(Debug)]
pub struct Shutdown {
    runners: Vec<RunnerHandle>,
    signals: AtomicU32,
}

impl Shutdown {
    pub fn new(runners: Vec<RunnerHandle>) -> Self {
        Self {
            runners,
            signals: AtomicU32::new(0),
        }
    }

    /// React to one termination signal.
    pub fn signal(&self) {
        let nth = self.signals.fetch_add(1, Ordering::SeqCst) + 1;
        if nth == 1 {
            warn!(
                runners = self.runners.len(),
                "shutdown requested; stopping agents (signal again to kill)"
            );
            for runner in &self.runners {
                runner.stop();
            }
        } else {
            warn!(runners = self.runners.len(), "second shutdown request; killing agents");
            for runner in &self.runners {
                runner.force_kill();
            }
        }
    }

    pub fn signals(&self) -> u32 {
        self.signals.load(Ordering::SeqCst)
    }

    /// Route process termination signals to [`signal`](Self::signal). Once per process.
    pub fn install(self: &Arc<Self>) -> Result<()> {
        let shutdown = Arc::clone(self);
        ctrlc::set_handler(move || shutdown.signal()).context("install signal handler")
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::status::RunnerStatus;
    use crate::test_support::{
        MemorySentinels, ScriptedInvoker, ScriptedRun, fast_options, join_within, scripted_runner,
        wait_for,
    };

    const SETTLE: Duration = Duration::from_secs(5);

    #[test]
    fn first_signal_stops_running_agents() {
        let store = Arc::new(MemorySentinels::with_design());
        let invoker = Arc::new(ScriptedInvoker::new(store.clone(), vec![ScriptedRun::held()]));
        let runner = scripted_runner(&store, &invoker, fast_options(3));
        runner.start().expect("start");
        assert!(wait_for(SETTLE, || invoker.live() == 1));

        let shutdown = Shutdown::new(vec![runner.handle()]);
        shutdown.signal();

        assert!(join_within(&runner, SETTLE));
        assert_eq!(runner.status(), RunnerStatus::Stopped);
        assert_eq!(invoker.live(), 0);
        assert_eq!(shutdown.signals(), 1);
    }

    #[test]
    fn second_signal_kills_agents_that_ignore_terminate() {
        let store = Arc::new(MemorySentinels::with_design());
        let invoker = Arc::new(ScriptedInvoker::new(
            store.clone(),
            vec![ScriptedRun::held().ignoring_terminate()],
        ));
        let options = crate::runner::RunnerOptions {
            stop_grace: Duration::from_secs(60),
            ..fast_options(3)
        };
        let runner = scripted_runner(&store, &invoker, options);
        runner.start().expect("start");
        assert!(wait_for(SETTLE, || invoker.live() == 1));

        let shutdown = Shutdown::new(vec![runner.handle()]);
        shutdown.signal();
        assert!(!join_within(&runner, Duration::from_millis(100)));
        assert_eq!(invoker.live(), 1);

        shutdown.signal();
        assert!(join_within(&runner, SETTLE));
        assert_eq!(runner.status(), RunnerStatus::Stopped);
        assert_eq!(invoker.live(), 0);
    }
}
