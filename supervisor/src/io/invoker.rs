//! Invoker abstraction for launching the agent.
//!
//! The [`Invoker`] trait decouples the loop from the concrete agent CLI. Tests
//! use scripted invokers that touch sentinel files instead of spawning processes.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Result, anyhow};
use tracing::{error, info, instrument};

use crate::core::types::InvocationParams;
use crate::io::config::AgentConfig;
use crate::io::process::{AgentHandle, spawn_agent};

/// Everything needed to launch one agent session.
#[derive(Debug, Clone, Copy)]
pub struct InvokeRequest<'a> {
    /// Supervised directory; becomes the child's working directory.
    pub workdir: &'a Path,
    pub prompt: &'a str,
    pub params: &'a InvocationParams,
    pub attempt: u32,
}

/// Abstraction over agent backends.
pub trait Invoker: Send + Sync {
    /// Start the agent. An `Err` is a launch failure; the runner records it and backs off.
    fn launch(&self, request: &InvokeRequest<'_>) -> Result<Box<dyn AgentHandle>>;
}

/// Invoker that runs a CLI agent as
/// `<program> --log-level <L> --model <M> [--variant <V>] run <prompt>`.
#[derive(Debug, Clone)]
pub struct CliInvoker {
    program: String,
    flatten_newlines: bool,
    output_log: Option<PathBuf>,
}

impl CliInvoker {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            flatten_newlines: false,
            output_log: None,
        }
    }

    pub fn from_config(cfg: &AgentConfig) -> Self {
        Self {
            program: cfg.program.clone(),
            flatten_newlines: cfg.flatten_newlines,
            output_log: cfg.output_log.clone(),
        }
    }

    pub fn flatten_newlines(mut self, flatten: bool) -> Self {
        self.flatten_newlines = flatten;
        self
    }

    pub fn output_log(mut self, path: Option<PathBuf>) -> Self {
        self.output_log = path;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Build the command line without spawning it.
    pub fn command(&self, request: &InvokeRequest<'_>) -> Command {
        let params = request.params;
        let mut cmd = Command::new(&self.program);
        cmd.arg("--log-level")
            .arg(&params.log_level)
            .arg("--model")
            .arg(&params.model);
        if let Some(variant) = &params.variant {
            cmd.arg("--variant").arg(variant);
        }
        cmd.arg("run").arg(self.prompt_arg(request.prompt));
        cmd
    }

    fn prompt_arg(&self, prompt: &str) -> String {
        if self.flatten_newlines {
            prompt.replace("\r\n", " ").replace('\n', " ")
        } else {
            prompt.to_string()
        }
    }
}

impl Invoker for CliInvoker {
    #[instrument(skip_all, fields(program = %self.program, attempt = request.attempt))]
    fn launch(&self, request: &InvokeRequest<'_>) -> Result<Box<dyn AgentHandle>> {
        let cmd = self.command(request);
        let output_log = self
            .output_log
            .as_ref()
            .map(|path| request.workdir.join(path));
        match spawn_agent(cmd, request.workdir, output_log.as_deref()) {
            Ok(handle) => {
                info!(pid = ?handle.id(), model = %request.params.model, "agent started");
                Ok(Box::new(handle))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                error!(err = %err, "agent executable not found");
                Err(anyhow!("{} command not found", self.program))
            }
            Err(err) => {
                error!(err = %err, "failed to spawn agent");
                Err(anyhow!("failed to start {}: {err}", self.program))
            }
        }
    }
}
