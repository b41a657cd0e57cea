//! Prompt and scaffold templates.
//!
//! Defaults are compiled into the binary. A template directory can replace
//! them; it must then provide all three files.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

const PROMPT_FILE: &str = "RALPH-PROMPT.md";
const PLAN_FILE: &str = "RALPH-PLAN.md";
const PROGRESS_FILE: &str = "RALPH-PROGRESS.md";

const BUILTIN_PROMPT: &str = include_str!("../../templates/RALPH-PROMPT.md");
const BUILTIN_PLAN: &str = include_str!("../../templates/RALPH-PLAN.md");
const BUILTIN_PROGRESS: &str = include_str!("../../templates/RALPH-PROGRESS.md");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Templates {
    /// Raw prompt template; see [`Templates::prompt`].
    pub prompt: String,
    /// Scaffold copied verbatim into a missing plan file.
    pub plan: String,
    /// Scaffold copied verbatim into a missing progress file.
    pub progress: String,
}

impl Templates {
    pub fn builtin() -> Self {
        Self {
            prompt: BUILTIN_PROMPT.to_string(),
            plan: BUILTIN_PLAN.to_string(),
            progress: BUILTIN_PROGRESS.to_string(),
        }
    }

    pub fn from_dir(dir: &Path) -> Result<Self> {
        Ok(Self {
            prompt: read_template(dir, PROMPT_FILE)?,
            plan: read_template(dir, PLAN_FILE)?,
            progress: read_template(dir, PROGRESS_FILE)?,
        })
    }

    /// Load from `dir` when configured, otherwise use the built-in set.
    pub fn load(dir: Option<&Path>) -> Result<Self> {
        match dir {
            Some(dir) => Self::from_dir(dir),
            None => Ok(Self::builtin()),
        }
    }

    /// The prompt handed to the agent: the template with surrounding whitespace trimmed.
    pub fn prompt(&self) -> &str {
        self.prompt.trim()
    }
}

fn read_template(dir: &Path, name: &str) -> Result<String> {
    let path = dir.join(name);
    fs::read_to_string(&path).with_context(|| format!("read template {}", path.display()))
}
