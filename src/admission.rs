//! Admission filter: static checks a file must pass before it may be
//! submitted to the queue.

use opentelemetry::KeyValue;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

use crate::model::{Candidate, display_name};
use crate::telemetry::metrics;

/// Why a candidate was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("unsupported extension {extension:?}")]
    UnsupportedExtension { extension: String },

    #[error("file too large ({size} bytes, max {max})")]
    TooLarge { size: u64, max: u64 },

    #[error("not a regular file")]
    NotAFile,
}

impl AdmissionError {
    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            AdmissionError::UnsupportedExtension { .. } => "extension",
            AdmissionError::TooLarge { .. } => "size",
            AdmissionError::NotAFile => "not_a_file",
        }
    }
}

/// Filter rules.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Allowed extensions, compared case-insensitively. A leading dot is
    /// optional (`".pdf"` and `"pdf"` are equivalent).
    pub extensions: Vec<String>,
    /// Maximum file size in bytes.
    pub max_file_size: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            extensions: vec!["pdf".to_string()],
            max_file_size: 50 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdmissionFilter {
    extensions: Vec<String>,
    max_file_size: u64,
}

impl AdmissionFilter {
    pub fn new(config: AdmissionConfig) -> Self {
        let extensions = config
            .extensions
            .iter()
            .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        Self {
            extensions,
            max_file_size: config.max_file_size,
        }
    }

    /// Check a candidate against the extension allow-list and size limit.
    pub fn check(&self, candidate: &Candidate) -> Result<(), AdmissionError> {
        let extension = candidate
            .path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();

        if !self.extensions.iter().any(|allowed| *allowed == extension) {
            return Err(AdmissionError::UnsupportedExtension { extension });
        }
        if candidate.size > self.max_file_size {
            return Err(AdmissionError::TooLarge {
                size: candidate.size,
                max: self.max_file_size,
            });
        }
        Ok(())
    }

    /// Check, log and count the verdict. Returns whether the candidate passed.
    pub fn admit(&self, candidate: &Candidate) -> bool {
        let name = display_name(&candidate.path);
        match self.check(candidate) {
            Ok(()) => true,
            Err(e @ AdmissionError::UnsupportedExtension { .. }) => {
                info!(file = %name, reason = %e, "file not supported");
                metrics::files_rejected().add(1, &[KeyValue::new("reason", e.reason())]);
                false
            }
            Err(e) => {
                warn!(file = %name, reason = %e, "file rejected");
                metrics::files_rejected().add(1, &[KeyValue::new("reason", e.reason())]);
                false
            }
        }
    }

    /// Stat a path on disk and check it. Used by the one-shot CLI commands.
    pub fn check_path(&self, path: &Path) -> crate::error::Result<Candidate> {
        let meta = std::fs::metadata(path)?;
        if !meta.is_file() {
            return Err(AdmissionError::NotAFile.into());
        }
        let candidate = Candidate {
            path: path.to_path_buf(),
            size: meta.len(),
        };
        self.check(&candidate)?;
        Ok(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn candidate(path: &str, size: u64) -> Candidate {
        Candidate {
            path: PathBuf::from(path),
            size,
        }
    }

    fn filter() -> AdmissionFilter {
        AdmissionFilter::new(AdmissionConfig {
            extensions: vec![".PDF".to_string(), "txt".to_string()],
            max_file_size: 1024,
        })
    }

    #[test]
    fn extension_match_ignores_case_and_leading_dot() {
        let f = filter();
        assert!(f.check(&candidate("/in/a.pdf", 10)).is_ok());
        assert!(f.check(&candidate("/in/B.Pdf", 10)).is_ok());
        assert!(f.check(&candidate("/in/notes.TXT", 10)).is_ok());
    }

    #[test]
    fn unknown_or_missing_extension_is_rejected() {
        let f = filter();
        assert_eq!(
            f.check(&candidate("/in/a.docx", 10)),
            Err(AdmissionError::UnsupportedExtension {
                extension: "docx".to_string()
            })
        );
        assert!(matches!(
            f.check(&candidate("/in/README", 10)),
            Err(AdmissionError::UnsupportedExtension { .. })
        ));
    }

    #[test]
    fn size_limit_is_inclusive() {
        let f = filter();
        assert!(f.check(&candidate("/in/a.pdf", 1024)).is_ok());
        assert_eq!(
            f.check(&candidate("/in/a.pdf", 1025)),
            Err(AdmissionError::TooLarge {
                size: 1025,
                max: 1024
            })
        );
    }

    #[test]
    fn check_path_rejects_directories() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("folder.pdf");
        std::fs::create_dir(&sub).unwrap();
        let err = filter().check_path(&sub).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Admission(AdmissionError::NotAFile)
        ));
    }

    #[test]
    fn check_path_reads_size_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("doc.pdf");
        std::fs::write(&file, b"%PDF-1.7").unwrap();
        let candidate = filter().check_path(&file).unwrap();
        assert_eq!(candidate.size, 8);
    }
}
