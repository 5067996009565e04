//! Work executors: what actually happens to a file once it is dispatched.
//!
//! The queue controller treats an executor as an opaque, possibly slow and
//! possibly flaky operation. Implementations must tolerate being re-run for
//! the same path after a failed attempt.

pub mod pipeline;

pub use pipeline::{PipelineDef, PipelineExecutor, StageDef};

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Result of a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    /// Where the produced artifact was written, if the executor produces one.
    pub output: Option<PathBuf>,
}

#[async_trait]
pub trait WorkExecutor: Send + Sync + 'static {
    /// Process one file. An `Err` is treated as a (possibly transient)
    /// failure of this attempt.
    async fn run(&self, path: &Path) -> Result<Completion>;
}
