//! Retry policy: how many times a failed file is re-run, how long it waits
//! first, and where it re-enters the pending queue.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Where a retried item re-enters the pending queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequeuePosition {
    /// Ahead of newer arrivals.
    #[default]
    Head,
    /// Behind everything already pending.
    Tail,
}

/// What happens to retries whose backoff timer is still running when the
/// controller is stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryOnStop {
    /// Timers still fire; the item lands in pending and waits there as
    /// backlog until the controller is resumed.
    #[default]
    Backlog,
    /// Timers are cancelled and each affected item fails terminally.
    Cancel,
}

impl std::str::FromStr for RequeuePosition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "head" => Ok(RequeuePosition::Head),
            "tail" => Ok(RequeuePosition::Tail),
            other => Err(format!("expected head or tail, got {other:?}")),
        }
    }
}

impl std::str::FromStr for RetryOnStop {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "backlog" => Ok(RetryOnStop::Backlog),
            "cancel" => Ok(RetryOnStop::Cancel),
            other => Err(format!("expected backlog or cancel, got {other:?}")),
        }
    }
}

/// Outcome of consulting the policy after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-run after `delay`.
    Retry { delay: Duration },
    /// Budget exhausted.
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Backoff unit.
    pub base_delay: Duration,
    pub requeue_position: RequeuePosition,
    pub on_stop: RetryOnStop,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            requeue_position: RequeuePosition::Head,
            on_stop: RetryOnStop::Backlog,
        }
    }
}

impl RetryPolicy {
    /// Linear backoff: the n-th retry waits `n × base_delay`.
    ///
    /// `attempt` is the number of executions made before the one that just
    /// failed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt.saturating_add(1))
    }

    /// Decide what to do after the attempt numbered `attempt` failed.
    pub fn decide(&self, attempt: u32) -> RetryDecision {
        if attempt < self.max_retries {
            RetryDecision::Retry {
                delay: self.backoff(attempt),
            }
        } else {
            RetryDecision::GiveUp
        }
    }
}
