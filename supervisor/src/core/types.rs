//! Shared deterministic types passed between the runner and the invoker.

use serde::{Deserialize, Serialize};

/// Parameters forwarded to the agent on every invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationParams {
    /// Model identifier passed via `--model`.
    pub model: String,
    /// Optional model variant passed via `--variant`; omitted when `None`.
    pub variant: Option<String>,
    /// Agent log level passed via `--log-level`.
    pub log_level: String,
}

impl InvocationParams {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            variant: None,
            log_level: "INFO".to_string(),
        }
    }

    pub fn with_variant(mut self, variant: Option<String>) -> Self {
        self.variant = normalize_variant(variant);
        self
    }

    pub fn with_log_level(mut self, log_level: impl Into<String>) -> Self {
        self.log_level = log_level.into();
        self
    }
}

/// Treat empty strings and the literal `"None"` as an unset variant.
pub fn normalize_variant(variant: Option<String>) -> Option<String> {
    variant.filter(|v| {
        let v = v.trim();
        !v.is_empty() && v != "None"
    })
}

/// How a single agent invocation ended.
///
/// Every outcome is non-fatal to the loop; the runner decides what comes next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationOutcome {
    /// Exit code zero.
    Succeeded,
    /// The agent ran and exited non-zero (or was killed by a signal).
    Exited { code: Option<i32> },
    /// The agent could not be started.
    LaunchFailed { message: String },
    /// A stop request interrupted the agent, which was then terminated.
    Interrupted,
}

impl InvocationOutcome {
    pub fn success(&self) -> bool {
        matches!(self, InvocationOutcome::Succeeded)
    }

    /// Message worth surfacing to the operator, if any.
    pub fn error_message(&self) -> Option<String> {
        match self {
            InvocationOutcome::Succeeded | InvocationOutcome::Interrupted => None,
            InvocationOutcome::Exited { code: Some(code) } => {
                Some(format!("agent exited with code {code}"))
            }
            InvocationOutcome::Exited { code: None } => {
                Some("agent terminated by signal".to_string())
            }
            InvocationOutcome::LaunchFailed { message } => Some(message.clone()),
        }
    }
}
