//! Periodic status reporting.
//!
//! Logs a one-line queue summary on an interval and, when configured,
//! keeps a JSON status file up to date for `hopper status` to read.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::queue::{QueueController, QueueStatus};

#[derive(Debug, Clone)]
pub struct ReportConfig {
    pub interval: Duration,
    pub status_file: Option<PathBuf>,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            status_file: None,
        }
    }
}

#[derive(Clone)]
pub struct StatusReporter {
    controller: QueueController,
    config: ReportConfig,
    shutdown: Arc<Notify>,
}

impl StatusReporter {
    pub fn new(controller: QueueController, config: ReportConfig) -> Self {
        Self {
            controller,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Ask [`run`](Self::run) to write a final report and return.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Report every interval until shut down.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    self.report_and_log();
                    return;
                }
                _ = ticker.tick() => self.report_and_log(),
            }
        }
    }

    fn report_and_log(&self) {
        if let Err(e) = self.report_once() {
            warn!("status report failed: {e}");
        }
    }

    /// Log the current status and write the status file if configured.
    pub fn report_once(&self) -> Result<QueueStatus> {
        let status = self.controller.status();
        let stats = &status.stats;
        info!(
            state = %status.state,
            queue_depth = stats.queue_depth,
            in_flight = stats.in_flight,
            retrying = stats.retrying,
            processed = stats.processed_total,
            failed = stats.failed_total,
            per_minute = %format!("{:.2}", stats.throughput_per_minute),
            uptime_secs = stats.uptime_secs,
            "queue status"
        );

        if let Some(ref path) = self.config.status_file {
            write_status_file(path, &status)?;
        }
        Ok(status)
    }
}

/// Write `status` as pretty JSON, via a temporary file and rename so
/// readers never see a partial document.
pub fn write_status_file(path: &Path, status: &QueueStatus) -> Result<()> {
    let json = serde_json::to_string_pretty(status)
        .map_err(|e| Error::Other(format!("serialize status: {e}")))?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Read a status file written by a running daemon.
pub fn read_status_file(path: &Path) -> Result<QueueStatus> {
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map_err(|e| Error::Other(format!("bad status file {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{Completion, WorkExecutor};
    use crate::queue::{QueueConfig, RunState};
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl WorkExecutor for Noop {
        async fn run(&self, _path: &Path) -> Result<Completion> {
            Ok(Completion::default())
        }
    }

    fn controller() -> QueueController {
        QueueController::new(QueueConfig::default(), Arc::new(Noop)).unwrap()
    }

    #[tokio::test]
    async fn report_once_writes_a_readable_status_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("state/status.json");
        let queue = controller();
        queue.stop();
        queue.submit("/in/a.pdf");

        let reporter = StatusReporter::new(
            queue,
            ReportConfig {
                interval: Duration::from_secs(60),
                status_file: Some(file.clone()),
            },
        );
        let written = reporter.report_once().unwrap();

        let read = read_status_file(&file).unwrap();
        assert_eq!(read, written);
        assert_eq!(read.state, RunState::Stopped);
        assert_eq!(read.stats.queue_depth, 1);
        assert_eq!(read.items[0].path, PathBuf::from("/in/a.pdf"));
        assert!(!dir.path().join("state/status.json.tmp").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn run_reports_on_interval_and_once_more_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("status.json");
        let reporter = StatusReporter::new(
            controller(),
            ReportConfig {
                interval: Duration::from_secs(30),
                status_file: Some(file.clone()),
            },
        );

        let task = {
            let reporter = reporter.clone();
            tokio::spawn(async move { reporter.run().await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(file.exists());

        std::fs::remove_file(&file).unwrap();
        reporter.shutdown();
        task.await.unwrap();
        assert!(file.exists());
    }

    #[test]
    fn unreadable_status_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("status.json");
        std::fs::write(&file, "not json").unwrap();
        assert!(read_status_file(&file).is_err());
        assert!(read_status_file(&dir.path().join("missing.json")).is_err());
    }
}
