//! I/O helpers: configuration, sentinel files, templates and agent processes.

pub mod config;
pub mod invoker;
pub mod process;
pub mod sentinel;
pub mod templates;
