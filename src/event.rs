//! Structured events emitted by the queue controller on terminal outcomes.
//!
//! Consumers subscribe to the event stream for logging, archiving or
//! alerting. Delivery is asynchronous with respect to `submit`; a lagging
//! or absent subscriber never stalls the controller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A structured event emitted by the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number. Consumers can detect gaps.
    pub seq: u64,
    /// When this event occurred.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// The pipeline succeeded for this file.
    Processed {
        path: PathBuf,
        /// Total executions, including the successful one.
        attempts: u32,
        duration_ms: u64,
        output: Option<PathBuf>,
    },
    /// The file exhausted its retry budget, or its pending retry was
    /// cancelled by `stop()`.
    Failed {
        path: PathBuf,
        error: String,
        attempts: u32,
    },
}

impl EventKind {
    pub fn path(&self) -> &PathBuf {
        match self {
            EventKind::Processed { path, .. } | EventKind::Failed { path, .. } => path,
        }
    }
}
