//! Error types for hopper.

use thiserror::Error;

use crate::admission::AdmissionError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("stage {stage} failed: {message}")]
    Stage { stage: String, message: String },

    #[error("stage {stage} timed out after {timeout_ms}ms")]
    Timeout { stage: String, timeout_ms: u64 },

    #[error("admission rejected: {0}")]
    Admission(#[from] AdmissionError),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
