//! The daemon: folder watcher → admission filter → queue controller, plus
//! the sink that reacts to terminal events.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use crate::admission::AdmissionFilter;
use crate::config::Config;
use crate::error::Result;
use crate::event::EventKind;
use crate::executor::WorkExecutor;
use crate::model::{Candidate, display_name};
use crate::queue::{QueueController, Rejection, SubmitResult};
use crate::report::StatusReporter;
use crate::watch::FolderWatcher;

/// How often deferred files are offered again when no event arrives.
const OVERFLOW_RETRY_INTERVAL: Duration = Duration::from_secs(1);

pub struct Service {
    config: Config,
    controller: QueueController,
    filter: AdmissionFilter,
    reporter: StatusReporter,
    shutdown: Arc<Notify>,
}

impl Service {
    pub fn new(config: Config, executor: Arc<dyn WorkExecutor>) -> Result<Self> {
        let controller = QueueController::new(config.queue_config(), executor)?;
        let filter = AdmissionFilter::new(config.admission_config());
        let reporter = StatusReporter::new(controller.clone(), config.report_config());
        Ok(Self {
            config,
            controller,
            filter,
            reporter,
            shutdown: Arc::new(Notify::new()),
        })
    }

    pub fn controller(&self) -> &QueueController {
        &self.controller
    }

    /// Signal [`run`](Self::run) to shut down gracefully.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run until shut down. On shutdown the watcher stops, dispatch stops,
    /// and in-flight executions are allowed to finish.
    pub async fn run(&self) -> Result<()> {
        self.ensure_directories()?;

        let mut events = self.controller.subscribe();
        let (mut watcher, mut candidates) = FolderWatcher::start(self.config.watch_config())?;

        let reporter = self.reporter.clone();
        let reporter_task = tokio::spawn(async move { reporter.run().await });

        let mut overflow = Overflow::new(self.config.overflow_limit);
        let mut overflow_tick = tokio::time::interval(OVERFLOW_RETRY_INTERVAL);

        info!(
            input = %self.config.input_folder.display(),
            output = %self.config.output_folder.display(),
            max_concurrent = self.config.max_concurrent,
            max_queue_size = self.config.max_queue_size,
            "service started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("service shutting down");
                    break;
                }
                candidate = candidates.recv() => match candidate {
                    Some(candidate) => self.offer(candidate, &mut overflow),
                    None => {
                        warn!("watcher stream ended");
                        break;
                    }
                },
                event = events.recv() => match event {
                    Ok(event) => {
                        self.on_event(event.kind).await;
                        overflow.resubmit(&self.controller);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event sink lagging, events dropped");
                        overflow.resubmit(&self.controller);
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = overflow_tick.tick(), if !overflow.is_empty() => {
                    overflow.resubmit(&self.controller);
                }
            }
        }

        watcher.stop();
        self.controller.stop();
        if self.controller.stats().in_flight > 0 {
            info!("waiting for in-flight files to finish");
        }
        self.controller.wait_for_in_flight().await;
        while let Ok(event) = events.try_recv() {
            self.on_event(event.kind).await;
        }
        if !overflow.is_empty() {
            warn!(deferred = overflow.len(), "shutting down with deferred files unqueued");
        }

        self.reporter.shutdown();
        if let Err(e) = reporter_task.await {
            warn!("status reporter ended abnormally: {e}");
        }
        info!("service stopped");
        Ok(())
    }

    fn ensure_directories(&self) -> Result<()> {
        let mut dirs = vec![
            self.config.input_folder.clone(),
            self.config.output_folder.clone(),
            self.config.scratch_folder.clone(),
        ];
        if self.config.archive_failed {
            dirs.push(self.config.errors_folder());
        }
        for dir in dirs {
            if !dir.exists() {
                std::fs::create_dir_all(&dir)?;
                info!(dir = %dir.display(), "created folder");
            }
        }
        Ok(())
    }

    /// Filter a candidate and submit it; defer it if the queue is full.
    fn offer(&self, candidate: Candidate, overflow: &mut Overflow) {
        if !self.filter.admit(&candidate) {
            return;
        }
        info!(file = %display_name(&candidate.path), size = candidate.size, "new file detected");

        match self.controller.submit(candidate.path.clone()) {
            SubmitResult::Accepted => {}
            SubmitResult::Rejected(Rejection::CapacityExceeded { .. }) => {
                overflow.push(candidate.path);
            }
            SubmitResult::Rejected(Rejection::AlreadyQueued) => {}
        }
    }

    async fn on_event(&self, kind: EventKind) {
        match kind {
            EventKind::Processed {
                path,
                attempts,
                duration_ms,
                output,
            } => {
                info!(
                    file = %display_name(&path),
                    output = output.as_ref().map(|o| o.display().to_string()),
                    attempts,
                    duration_ms,
                    "processing complete"
                );
            }
            EventKind::Failed {
                path,
                error,
                attempts,
            } => {
                error!(file = %display_name(&path), attempts, %error, "processing failed");
                if self.config.archive_failed {
                    match archive(&path, &self.config.errors_folder()).await {
                        Ok(dest) => info!(dest = %dest.display(), "failed file archived"),
                        Err(e) => warn!(file = %display_name(&path), "archive failed: {e}"),
                    }
                }
            }
        }
    }
}

/// Files refused for lack of capacity, oldest first. They stay on disk and
/// are offered again as capacity frees up.
struct Overflow {
    paths: VecDeque<PathBuf>,
    limit: usize,
}

impl Overflow {
    fn new(limit: usize) -> Self {
        Self {
            paths: VecDeque::new(),
            limit,
        }
    }

    fn len(&self) -> usize {
        self.paths.len()
    }

    fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    fn push(&mut self, path: PathBuf) {
        if self.paths.len() >= self.limit {
            warn!(
                file = %display_name(&path),
                limit = self.limit,
                "queue and overflow full, dropping file"
            );
            return;
        }
        warn!(
            file = %display_name(&path),
            deferred = self.paths.len() + 1,
            "queue full, file deferred until there is space"
        );
        self.paths.push_back(path);
    }

    /// Submit deferred files in order until the queue refuses one.
    fn resubmit(&mut self, controller: &QueueController) {
        while let Some(path) = self.paths.front() {
            if !path.exists() {
                debug!(file = %display_name(path), "deferred file vanished");
                self.paths.pop_front();
                continue;
            }
            match controller.submit(path.clone()) {
                SubmitResult::Rejected(Rejection::CapacityExceeded { .. }) => return,
                SubmitResult::Accepted | SubmitResult::Rejected(Rejection::AlreadyQueued) => {
                    self.paths.pop_front();
                }
            }
        }
    }
}

/// Move `path` into `dir`, keeping its name unless that is taken.
pub async fn archive(path: &Path, dir: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let name = display_name(path);
    let mut dest = dir.join(&name);
    if tokio::fs::try_exists(&dest).await? {
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%3f");
        dest = dir.join(format!("{stamp}-{name}"));
    }

    if tokio::fs::rename(path, &dest).await.is_err() {
        // Different filesystem: fall back to copy and delete.
        tokio::fs::copy(path, &dest).await?;
        tokio::fs::remove_file(path).await?;
    }
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn archive_keeps_name_and_avoids_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let errors = dir.path().join("errors");

        let first = dir.path().join("a.pdf");
        std::fs::write(&first, b"one").unwrap();
        let dest = archive(&first, &errors).await.unwrap();
        assert_eq!(dest, errors.join("a.pdf"));
        assert!(!first.exists());

        std::fs::write(&first, b"two").unwrap();
        let dest2 = archive(&first, &errors).await.unwrap();
        assert_ne!(dest2, dest);
        assert!(dest2.file_name().unwrap().to_string_lossy().ends_with("-a.pdf"));
        assert_eq!(std::fs::read(&dest2).unwrap(), b"two");
    }

    #[test]
    fn overflow_drops_beyond_limit() {
        let mut overflow = Overflow::new(2);
        overflow.push(PathBuf::from("/in/a.pdf"));
        overflow.push(PathBuf::from("/in/b.pdf"));
        overflow.push(PathBuf::from("/in/c.pdf"));
        assert_eq!(overflow.len(), 2);
    }
}
