//! The admission-controlled work queue.
//!
//! Files are admitted up to a capacity bound, dispatched oldest first up to
//! a concurrency bound, and retried with linear backoff until their retry
//! budget runs out.

pub mod controller;
pub mod retry;
pub mod stats;

pub use controller::{QueueConfig, QueueController, Rejection, SubmitResult};
pub use retry::{RequeuePosition, RetryDecision, RetryOnStop, RetryPolicy};
pub use stats::{QueueStats, QueueStatus, RunState};
