//! Sentinel files: the filesystem protocol between supervisor and agent.
//!
//! Only existence matters for the control sentinels. The plan and progress
//! files are the exception: they are scaffolded from templates when absent.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info};

/// Marker files recognized at the root of a supervised directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentinel {
    /// Required input; absence is fatal before the loop starts.
    Design,
    Plan,
    Progress,
    /// Terminal success.
    Done,
    /// Terminal failure that needs an operator.
    Blocked,
    /// External halt request.
    Stop,
    /// One unit of work finished; consumed on sight.
    Checkpoint,
}

impl Sentinel {
    pub const ALL: [Sentinel; 7] = [
        Sentinel::Design,
        Sentinel::Plan,
        Sentinel::Progress,
        Sentinel::Done,
        Sentinel::Blocked,
        Sentinel::Stop,
        Sentinel::Checkpoint,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            Sentinel::Design => "RALPH-DESIGN.md",
            Sentinel::Plan => "RALPH-PLAN.md",
            Sentinel::Progress => "RALPH-PROGRESS.md",
            Sentinel::Done => "RALPH-COMPLETE.md",
            Sentinel::Blocked => "RALPH-BLOCKED.md",
            Sentinel::Stop => "RALPH-STOP",
            Sentinel::Checkpoint => "RALPH-CHECKPOINT.md",
        }
    }
}

/// Access to the sentinel files of one supervised directory.
///
/// The runner talks to the agent exclusively through this trait; tests swap in
/// an in-memory store.
pub trait SentinelStore: Send + Sync {
    fn exists(&self, sentinel: Sentinel) -> Result<bool>;

    /// Delete the sentinel. Returns `false` if it was already absent.
    fn remove(&self, sentinel: Sentinel) -> Result<bool>;

    fn read(&self, sentinel: Sentinel) -> Result<Option<String>>;

    fn write(&self, sentinel: Sentinel, contents: &str) -> Result<()>;
}

/// Sentinel store backed by a real directory.
#[derive(Debug, Clone)]
pub struct FsSentinels {
    root: PathBuf,
}

impl FsSentinels {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, sentinel: Sentinel) -> PathBuf {
        self.root.join(sentinel.file_name())
    }
}

impl SentinelStore for FsSentinels {
    fn exists(&self, sentinel: Sentinel) -> Result<bool> {
        let path = self.path(sentinel);
        path.try_exists()
            .with_context(|| format!("stat {}", path.display()))
    }

    fn remove(&self, sentinel: Sentinel) -> Result<bool> {
        let path = self.path(sentinel);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "removed sentinel");
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
        }
    }

    fn read(&self, sentinel: Sentinel) -> Result<Option<String>> {
        let path = self.path(sentinel);
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
        }
    }

    fn write(&self, sentinel: Sentinel, contents: &str) -> Result<()> {
        let path = self.path(sentinel);
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }
}

/// Write `template` to `sentinel` unless it already exists. Returns whether it was created.
pub fn scaffold_if_absent(
    store: &dyn SentinelStore,
    sentinel: Sentinel,
    template: &str,
) -> Result<bool> {
    if store.exists(sentinel)? {
        return Ok(false);
    }
    store.write(sentinel, template)?;
    info!(file = sentinel.file_name(), "created scaffold");
    Ok(true)
}

/// Delete the checkpoint sentinel if present. Returns whether one was consumed.
pub fn consume_checkpoint(store: &dyn SentinelStore) -> Result<bool> {
    if !store.exists(Sentinel::Checkpoint)? {
        return Ok(false);
    }
    store.remove(Sentinel::Checkpoint)?;
    Ok(true)
}

/// Presence of every sentinel, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SentinelReport {
    pub entries: Vec<SentinelEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SentinelEntry {
    pub sentinel: Sentinel,
    pub file: &'static str,
    pub present: bool,
}

impl SentinelReport {
    pub fn collect(store: &dyn SentinelStore) -> Result<Self> {
        let entries = Sentinel::ALL
            .iter()
            .map(|&sentinel| {
                Ok(SentinelEntry {
                    sentinel,
                    file: sentinel.file_name(),
                    present: store.exists(sentinel)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { entries })
    }

    pub fn is_present(&self, sentinel: Sentinel) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.sentinel == sentinel && entry.present)
    }
}
