//! Error type, options and run reports shared by the library and the CLI.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::DatabaseError;
use crate::item::ParseError;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Parse error: {0}")]
    Parse(ParseError),
    #[error("Reference error: {0}")]
    Reference(String),
    #[error("Index store error: {0}")]
    Store(#[from] DatabaseError),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<ParseError> for PoolError {
    fn from(e: ParseError) -> Self {
        match e {
            ParseError::Reference(msg) => PoolError::Reference(msg),
            other => PoolError::Parse(other),
        }
    }
}

impl From<rusqlite::Error> for PoolError {
    fn from(e: rusqlite::Error) -> Self {
        PoolError::Store(DatabaseError::Sqlite(e))
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;

/// Options for update runs (CLI, watcher or embedding application).
#[derive(Clone, Debug)]
pub struct UpdateOptions {
    /// When a file disappears, also delete the items of the same pool that
    /// depend on it instead of leaving their edges dangling.
    pub cascade_delete: bool,
    /// After a single-file update, re-index the items directly depending on it.
    pub refresh_dependents: bool,
    /// Checked between files; a set flag ends the run before the next file.
    pub cancel: Arc<AtomicBool>,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            cascade_delete: false,
            refresh_dependents: true,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl UpdateOptions {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

/// Phase of an update run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdatePhase {
    Idle,
    Walking,
    Parsing,
    Writing,
    Done,
}

/// Per-file failure collected during a run.
#[derive(Debug, Clone, Serialize)]
pub struct FileFailure {
    pub file: PathBuf,
    pub message: String,
}

/// Outcome of one update run.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub files: usize,
    pub written: usize,
    pub deleted: usize,
    pub failures: Vec<FileFailure>,
    pub cancelled: bool,
}

impl UpdateReport {
    pub(crate) fn start() -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: now,
            files: 0,
            written: 0,
            deleted: 0,
            failures: Vec::new(),
            cancelled: false,
        }
    }

    pub fn error_count(&self) -> usize {
        self.failures.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }

    pub(crate) fn merge(&mut self, other: UpdateReport) {
        self.files += other.files;
        self.written += other.written;
        self.deleted += other.deleted;
        self.failures.extend(other.failures);
        self.cancelled |= other.cancelled;
        self.finished_at = other.finished_at;
    }
}
