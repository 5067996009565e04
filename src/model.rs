//! Core data model.
//!
//! A work item is one file waiting for, or undergoing, pipeline execution.
//! Its identity is the path the watcher reported.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// A unit of pending or in-flight work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// The file to process. Unique among live items.
    pub path: PathBuf,

    /// Most recent admission or re-admission into the pending queue.
    pub enqueued_at: DateTime<Utc>,

    /// Number of execution attempts already made.
    pub attempt: u32,
}

impl WorkItem {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            enqueued_at: Utc::now(),
            attempt: 0,
        }
    }

    /// Count a failed attempt that will be retried.
    pub(crate) fn failed_attempt(self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self
        }
    }

    /// The item as it re-enters the pending queue after its backoff.
    pub(crate) fn readmitted(self) -> Self {
        Self {
            enqueued_at: Utc::now(),
            ..self
        }
    }

    /// File name for log lines; falls back to the full path.
    pub fn display_name(&self) -> String {
        display_name(&self.path)
    }
}

pub(crate) fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a work item inside the queue controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    /// Waiting in the pending queue.
    Pending,
    /// Executing; counted against the concurrency limit.
    InFlight,
    /// Failed with retry budget left, waiting out its backoff delay.
    PendingRetry,
    /// Done successfully. Terminal.
    Processed,
    /// Exhausted retries. Terminal.
    Failed,
}

impl ItemState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: ItemState) -> bool {
        use ItemState::*;
        matches!(
            (self, to),
            (Pending, InFlight)
                | (InFlight, Processed)
                | (InFlight, PendingRetry)
                | (InFlight, Failed)
                | (PendingRetry, Pending)
                | (PendingRetry, Failed) // retry cancelled by stop
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemState::Processed | ItemState::Failed)
    }
}

impl std::fmt::Display for ItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ItemState::Pending => "pending",
            ItemState::InFlight => "in_flight",
            ItemState::PendingRetry => "pending_retry",
            ItemState::Processed => "processed",
            ItemState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Snapshot views
// ---------------------------------------------------------------------------

/// Per-item line of a status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemSummary {
    pub path: PathBuf,
    pub state: ItemState,
    pub enqueued_at: DateTime<Utc>,
    pub attempt: u32,
}

impl ItemSummary {
    pub(crate) fn of(item: &WorkItem, state: ItemState) -> Self {
        Self {
            path: item.path.clone(),
            state,
            enqueued_at: item.enqueued_at,
            attempt: item.attempt,
        }
    }
}

// ---------------------------------------------------------------------------
// Candidate
// ---------------------------------------------------------------------------

/// A fully written file reported by the watcher, not yet admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    /// Size in bytes once the file stopped changing.
    pub size: u64,
}
