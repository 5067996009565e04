//! Typed configuration from environment variables.
//!
//! Loads once at startup and fails fast if required vars are missing or a
//! value does not parse. In local dev, call `dotenvy::dotenv().ok()` first.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::admission::AdmissionConfig;
use crate::error::{Error, Result};
use crate::queue::{QueueConfig, RequeuePosition, RetryOnStop, RetryPolicy};
use crate::report::ReportConfig;
use crate::watch::WatchConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub input_folder: PathBuf,
    pub output_folder: PathBuf,
    pub pipeline_file: PathBuf,
    /// Parent of the per-attempt scratch directories.
    pub scratch_folder: PathBuf,

    pub max_concurrent: usize,
    pub max_queue_size: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub retry_position: RequeuePosition,
    pub retry_on_stop: RetryOnStop,
    /// Per-stage timeout for the pipeline executor.
    pub process_timeout: Duration,

    pub supported_extensions: Vec<String>,
    pub max_file_size: u64,
    pub stability_threshold: Duration,
    pub stability_poll: Duration,

    pub status_file: Option<PathBuf>,
    pub status_interval: Duration,
    /// Move terminally failed inputs into `<output>/errors`.
    pub archive_failed: bool,
    /// Queue-full rejections kept for resubmission.
    pub overflow_limit: usize,

    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let vars = Vars(&lookup);
        let output_folder = PathBuf::from(vars.required("OUTPUT_FOLDER")?);

        Ok(Self {
            input_folder: PathBuf::from(vars.required("INPUT_FOLDER")?),
            pipeline_file: vars
                .get("PIPELINE_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("pipeline.toml")),
            scratch_folder: vars
                .get("SCRATCH_FOLDER")
                .map(PathBuf::from)
                .unwrap_or_else(|| std::env::temp_dir().join("hopper")),
            output_folder,

            max_concurrent: vars.parsed("MAX_CONCURRENT", 3)?,
            max_queue_size: vars.parsed("MAX_QUEUE_SIZE", 100)?,
            max_retries: vars.parsed("MAX_RETRIES", 3)?,
            retry_delay: Duration::from_millis(vars.parsed("RETRY_DELAY_MS", 1000)?),
            retry_position: vars.parsed("RETRY_POSITION", RequeuePosition::Head)?,
            retry_on_stop: vars.parsed("RETRY_ON_STOP", RetryOnStop::Backlog)?,
            process_timeout: Duration::from_millis(vars.parsed("PROCESS_TIMEOUT_MS", 300_000)?),

            supported_extensions: vars
                .get("SUPPORTED_EXTENSIONS")
                .map(|v| {
                    v.split(',')
                        .map(|e| e.trim().to_string())
                        .filter(|e| !e.is_empty())
                        .collect()
                })
                .unwrap_or_else(|| vec![".pdf".to_string()]),
            max_file_size: vars.parsed("MAX_FILE_SIZE", 50 * 1024 * 1024)?,
            stability_threshold: Duration::from_millis(vars.parsed("STABILITY_THRESHOLD_MS", 2000)?),
            stability_poll: Duration::from_millis(vars.parsed("STABILITY_POLL_MS", 100)?),

            status_file: vars.get("STATUS_FILE").map(PathBuf::from),
            status_interval: Duration::from_secs(vars.parsed("STATUS_INTERVAL_SECS", 30)?),
            archive_failed: vars.flag("ARCHIVE_FAILED", true)?,
            overflow_limit: vars.parsed("OVERFLOW_LIMIT", 1000)?,

            otel_endpoint: vars.get("OTEL_ENDPOINT"),
            log_level: vars.get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            capacity: self.max_queue_size,
            concurrency_limit: self.max_concurrent,
            retry: RetryPolicy {
                max_retries: self.max_retries,
                base_delay: self.retry_delay,
                requeue_position: self.retry_position,
                on_stop: self.retry_on_stop,
            },
            ..QueueConfig::default()
        }
    }

    pub fn watch_config(&self) -> WatchConfig {
        WatchConfig {
            stability_threshold: self.stability_threshold,
            poll_interval: self.stability_poll,
            ..WatchConfig::new(&self.input_folder)
        }
    }

    pub fn admission_config(&self) -> AdmissionConfig {
        AdmissionConfig {
            extensions: self.supported_extensions.clone(),
            max_file_size: self.max_file_size,
        }
    }

    pub fn report_config(&self) -> ReportConfig {
        ReportConfig {
            interval: self.status_interval,
            status_file: self.status_file.clone(),
        }
    }

    /// Where terminally failed inputs are archived.
    pub fn errors_folder(&self) -> PathBuf {
        self.output_folder.join("errors")
    }
}

/// Thin accessor over a variable source. Empty values count as unset.
struct Vars<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Vars<'_, F> {
    fn get(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, name: &str) -> Result<String> {
        self.get(name).ok_or_else(|| {
            Error::Config(format!("required environment variable {name} is not set"))
        })
    }

    fn parsed<T>(&self, name: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(name) {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|e| Error::Config(format!("invalid value for {name} ({raw:?}): {e}"))),
            None => Ok(default),
        }
    }

    fn flag(&self, name: &str, default: bool) -> Result<bool> {
        match self.get(name).map(|v| v.trim().to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
            Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
            Some(v) => Err(Error::Config(format!(
                "invalid value for {name} ({v:?}): expected true or false"
            ))),
        }
    }
}
