//! Cumulative counters and the read-only snapshots built from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use crate::model::ItemSummary;

/// Counters owned by the controller. Only ever mutated under its lock.
#[derive(Debug)]
pub(crate) struct Stats {
    /// Admissions plus re-admissions after backoff.
    pub queued_total: u64,
    pub processed_total: u64,
    /// Terminal failures only.
    pub failed_total: u64,
    pub retried_total: u64,
    pub started_at: DateTime<Utc>,
    started: Instant,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            queued_total: 0,
            processed_total: 0,
            failed_total: 0,
            retried_total: 0,
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Whether the dispatch loop is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Dispatch loop running.
    Running,
    /// Nothing to do; the next accepted submission starts the loop.
    Idle,
    /// `stop()` was called. Submissions accumulate as backlog.
    Stopped,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Running => "running",
            RunState::Idle => "idle",
            RunState::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// Counters and live sizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue_depth: usize,
    pub in_flight: usize,
    /// Items waiting out a backoff delay.
    pub retrying: usize,
    pub capacity: usize,
    pub concurrency_limit: usize,
    pub queued_total: u64,
    pub processed_total: u64,
    pub failed_total: u64,
    pub retried_total: u64,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub throughput_per_minute: f64,
}

/// Full status: run state, stats and one line per live item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub state: RunState,
    #[serde(flatten)]
    pub stats: QueueStats,
    pub items: Vec<ItemSummary>,
}

/// Processed items per minute of uptime. Zero before any time has passed.
pub fn throughput_per_minute(processed: u64, uptime: Duration) -> f64 {
    let minutes = uptime.as_secs_f64() / 60.0;
    if minutes <= 0.0 {
        return 0.0;
    }
    processed as f64 / minutes
}
