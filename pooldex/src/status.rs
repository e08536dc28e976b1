//! Progress events emitted by update runs.

use std::path::{Path, PathBuf};

use serde::Serialize;

/// One progress event. A run emits one `File` or `FileError` per processed
/// file, in walk order, and ends with `Done`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatusEvent {
    File { path: PathBuf, message: String },
    FileError { path: PathBuf, message: String },
    Done { path: PathBuf, message: String, errors: usize },
}

impl StatusEvent {
    pub fn path(&self) -> &Path {
        match self {
            StatusEvent::File { path, .. }
            | StatusEvent::FileError { path, .. }
            | StatusEvent::Done { path, .. } => path,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            StatusEvent::File { message, .. }
            | StatusEvent::FileError { message, .. }
            | StatusEvent::Done { message, .. } => message,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, StatusEvent::FileError { .. })
    }
}

/// Receiver of status events. Called synchronously from the updater.
pub trait StatusSink {
    fn on_status(&mut self, event: &StatusEvent);
}

impl<F> StatusSink for F
where
    F: FnMut(&StatusEvent),
{
    fn on_status(&mut self, event: &StatusEvent) {
        self(event)
    }
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl StatusSink for NullSink {
    fn on_status(&mut self, _event: &StatusEvent) {}
}

/// Sink that keeps every event, mostly for tests and batch reporting.
#[derive(Debug, Default, Clone)]
pub struct CollectingSink {
    pub events: Vec<StatusEvent>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn errors(&self) -> impl Iterator<Item = &StatusEvent> {
        self.events.iter().filter(|e| e.is_error())
    }

    pub fn done(&self) -> Option<&StatusEvent> {
        self.events
            .iter()
            .rev()
            .find(|e| matches!(e, StatusEvent::Done { .. }))
    }
}

impl StatusSink for CollectingSink {
    fn on_status(&mut self, event: &StatusEvent) {
        self.events.push(event.clone());
    }
}
