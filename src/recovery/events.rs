//! Restore progress events and the sinks that receive them.
//!
//! The restore engine only emits facts; formatting for humans happens in
//! `Display`, routing happens in the [`RestoreLog`] implementation.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::Level;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RestoreEvent {
    /// Block at `position` was rebuilt from row `row` (1-based).
    BlockRestored { position: u64, row: usize },
    /// Data reconstructed from row `row` did not match the stored checksum.
    ChecksumRejected { position: u64, row: usize },
    /// No source for the block at `position`; filler will be used.
    BlockNotRecoverable { position: u64 },
    /// Row slots outside the damaged area are not zero: the record does not
    /// describe this file and is ignored for restoring.
    RecordUnreliable { row: usize, slot: usize },
    /// Missing blocks but the record carries no rows.
    NoRedundancy { missing: usize },
}

impl RestoreEvent {
    pub fn severity(&self) -> Level {
        match self {
            RestoreEvent::BlockRestored { .. } => Level::INFO,
            RestoreEvent::ChecksumRejected { .. } => Level::DEBUG,
            RestoreEvent::BlockNotRecoverable { .. }
            | RestoreEvent::RecordUnreliable { .. }
            | RestoreEvent::NoRedundancy { .. } => Level::WARN,
        }
    }

    /// Nesting depth under the per-file heading.
    pub fn indent(&self) -> usize {
        match self {
            RestoreEvent::RecordUnreliable { .. } | RestoreEvent::NoRedundancy { .. } => 1,
            _ => 2,
        }
    }
}

impl fmt::Display for RestoreEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestoreEvent::BlockRestored { position, row } => {
                write!(f, "block at offset {position} restored from row {row}")
            }
            RestoreEvent::ChecksumRejected { position, row } => {
                write!(f, "row {row} data for offset {position} fails its checksum")
            }
            RestoreEvent::BlockNotRecoverable { position } => {
                write!(f, "block at offset {position} is not recoverable")
            }
            RestoreEvent::RecordUnreliable { row, slot } => {
                write!(f, "saved info unreliable (row {row} slot {slot} not zero), ignoring")
            }
            RestoreEvent::NoRedundancy { missing } => {
                write!(f, "saved info has no redundancy rows, {missing} block(s) lost")
            }
        }
    }
}

// ── Sinks ─────────────────────────────────────────────────────────────────────

pub trait RestoreLog: Send + Sync {
    fn emit(&self, file_label: &str, event: &RestoreEvent);
}

impl<L: RestoreLog + ?Sized> RestoreLog for Arc<L> {
    fn emit(&self, file_label: &str, event: &RestoreEvent) {
        (**self).emit(file_label, event)
    }
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLog;

impl RestoreLog for TracingLog {
    fn emit(&self, file_label: &str, event: &RestoreEvent) {
        let level = event.severity();
        let indent = event.indent();
        if level == Level::WARN {
            tracing::warn!(file = file_label, indent, "{event}");
        } else if level == Level::INFO {
            tracing::info!(file = file_label, indent, "{event}");
        } else {
            tracing::debug!(file = file_label, indent, "{event}");
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullLog;

impl RestoreLog for NullLog {
    fn emit(&self, _: &str, _: &RestoreEvent) {}
}

/// Keeps every event, for reports and tests.
#[derive(Debug, Default)]
pub struct CollectingLog {
    events: Mutex<Vec<(String, RestoreEvent)>>,
}

impl CollectingLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RestoreEvent> {
        self.events.lock().iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn take(&self) -> Vec<(String, RestoreEvent)> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl RestoreLog for CollectingLog {
    fn emit(&self, file_label: &str, event: &RestoreEvent) {
        self.events.lock().push((file_label.to_owned(), event.clone()));
    }
}
