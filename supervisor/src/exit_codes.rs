//! Stable exit codes for supervisor CLI commands.

/// Command succeeded; for `run`, every task completed.
pub const OK: i32 = 0;
/// Invalid arguments, config or directory, or a task failed.
pub const INVALID: i32 = 1;
/// A task ended blocked (`RALPH-BLOCKED.md`).
pub const BLOCKED: i32 = 2;
/// A task was stopped by the operator or the stop file.
pub const STOPPED: i32 = 3;
