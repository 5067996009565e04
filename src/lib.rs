//! # hopper
//!
//! Drop-folder file processor built around an admission-controlled work
//! queue.
//!
//! A folder watcher reports fully written files, an admission filter checks
//! them, and the queue controller runs them through a command pipeline with
//! bounded capacity, bounded concurrency and linear-backoff retries.

pub mod admission;
pub mod config;
pub mod error;
pub mod event;
pub mod executor;
pub mod model;
pub mod queue;
pub mod report;
pub mod service;
pub mod telemetry;
pub mod watch;
