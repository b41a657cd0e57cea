//! Supervisor configuration stored as TOML (default `supervisor.toml`).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::normalize_variant;

pub const DEFAULT_CONFIG_FILE: &str = "supervisor.toml";

/// Supervisor configuration (TOML).
///
/// Missing fields default to the values the loop has always used: 40 attempts
/// two seconds apart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Attempt budget per run.
    pub max_attempts: u32,

    /// Length of checkpoint, backoff and cooldown waits, in seconds.
    pub delay_secs: u64,

    /// How often a running agent is polled for exit, in milliseconds.
    pub poll_interval_ms: u64,

    /// Grace period between terminate and kill on a graceful stop.
    pub stop_grace_secs: u64,

    /// Bounded reap after a force kill.
    pub kill_grace_secs: u64,

    /// Directory overriding the built-in prompt/plan/progress templates.
    pub template_dir: Option<PathBuf>,

    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent executable.
    pub program: String,
    pub model: Option<String>,
    pub variant: Option<String>,
    pub log_level: String,
    /// Replace newlines in the prompt with spaces, for shells that cannot pass
    /// multi-line arguments.
    pub flatten_newlines: bool,
    /// Append agent stdout/stderr here instead of inheriting the terminal.
    pub output_log: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: "opencode".to_string(),
            model: None,
            variant: None,
            log_level: "INFO".to_string(),
            flatten_newlines: false,
            output_log: None,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 40,
            delay_secs: 2,
            poll_interval_ms: 200,
            stop_grace_secs: 5,
            kill_grace_secs: 2,
            template_dir: None,
            agent: AgentConfig::default(),
        }
    }
}

impl SupervisorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow!("max_attempts must be > 0"));
        }
        if self.poll_interval_ms == 0 {
            return Err(anyhow!("poll_interval_ms must be > 0"));
        }
        if self.poll_interval_ms >= 1_000 {
            return Err(anyhow!(
                "poll_interval_ms must be < 1000 to keep stop latency sub-second"
            ));
        }
        if self.agent.program.trim().is_empty() {
            return Err(anyhow!("agent.program must be non-empty"));
        }
        if self.agent.log_level.trim().is_empty() {
            return Err(anyhow!("agent.log_level must be non-empty"));
        }
        if let Some(model) = &self.agent.model
            && model.trim().is_empty()
        {
            return Err(anyhow!("agent.model must be non-empty when set"));
        }
        Ok(())
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    pub fn variant(&self) -> Option<String> {
        normalize_variant(self.agent.variant.clone())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `SupervisorConfig::default()`.
pub fn load_config(path: &Path) -> Result<SupervisorConfig> {
    if !path.exists() {
        let cfg = SupervisorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: SupervisorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &SupervisorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
