//! Supervisor for autonomous coding-agent loops.
//!
//! Each supervised directory gets a [`runner::LoopRunner`] that repeatedly
//! invokes an agent CLI and reads sentinel files the agent leaves behind to
//! decide whether to restart, back off, ask the operator, or stop. The crate
//! keeps the usual split:
//!
//! - **[`core`]**: Pure, deterministic logic (status transitions, wait
//!   bookkeeping, invocation types). No I/O.
//! - **[`io`]**: Side effects (sentinel files, config, templates, child
//!   processes). Behind traits where tests need doubles.
//!
//! Orchestration modules ([`runner`], [`task`], [`control`]) tie the two
//! together and back the CLI commands.

pub mod control;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod runner;
pub mod shutdown;
pub mod task;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
