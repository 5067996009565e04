//! Folder watcher: turns filesystem activity under the input folder into a
//! stream of fully written candidate files.
//!
//! `notify` events are bridged into tokio through a bounded channel. Each
//! new file is observed until it stops changing, then reported once. Files
//! already present at startup are reported too.

pub mod stability;

use notify::event::ModifyKind;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::Result;
use crate::model::Candidate;

/// Capacity of the channel bridging `notify` callbacks into tokio. When it
/// is full, a rescan of the whole folder replaces the dropped events.
const BRIDGE_CAPACITY: usize = 512;

/// Candidates buffered for the consumer.
const CANDIDATE_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Folder to watch, recursively.
    pub root: PathBuf,
    /// How long a file must stay unchanged before it is reported.
    pub stability_threshold: Duration,
    /// How often an observed file is re-checked.
    pub poll_interval: Duration,
    /// Report files already present when watching starts.
    pub initial_scan: bool,
}

impl WatchConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            stability_threshold: Duration::from_secs(2),
            poll_interval: Duration::from_millis(100),
            initial_scan: true,
        }
    }
}

/// Watches a folder. Dropping it, or calling [`stop`](Self::stop), ends
/// the candidate stream.
pub struct FolderWatcher {
    watcher: Option<RecommendedWatcher>,
    task: JoinHandle<()>,
    root: PathBuf,
}

impl FolderWatcher {
    /// Start watching. Returns the watcher and the receiving end of the
    /// candidate stream.
    pub fn start(config: WatchConfig) -> Result<(Self, mpsc::Receiver<Candidate>)> {
        let (bridge_tx, bridge_rx) = mpsc::channel::<notify::Event>(BRIDGE_CAPACITY);
        let (candidate_tx, candidate_rx) = mpsc::channel(CANDIDATE_CAPACITY);
        let rescan_needed = Arc::new(AtomicBool::new(false));

        let mut watcher = {
            let rescan = Arc::clone(&rescan_needed);
            RecommendedWatcher::new(
                move |res: notify::Result<notify::Event>| match res {
                    Ok(event) => {
                        if bridge_tx.try_send(event).is_err() && !rescan.swap(true, Ordering::Relaxed)
                        {
                            warn!(
                                capacity = BRIDGE_CAPACITY,
                                "watcher channel full, falling back to rescan"
                            );
                        }
                    }
                    Err(e) => warn!("filesystem watcher error: {e}"),
                },
                notify::Config::default(),
            )?
        };
        watcher.watch(&config.root, RecursiveMode::Recursive)?;

        info!(root = %config.root.display(), "watching folder");

        let root = config.root.clone();
        let ctx = LoopContext {
            config,
            candidates: candidate_tx,
            known: Arc::new(Mutex::new(HashSet::new())),
            rescan_needed,
        };
        let task = tokio::spawn(ctx.run(bridge_rx));

        Ok((
            Self {
                watcher: Some(watcher),
                task,
                root,
            },
            candidate_rx,
        ))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stop watching. Files still under observation are abandoned.
    pub fn stop(&mut self) {
        if self.watcher.take().is_some() {
            info!(root = %self.root.display(), "folder watcher stopped");
        }
        self.task.abort();
    }
}

impl Drop for FolderWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct LoopContext {
    config: WatchConfig,
    candidates: mpsc::Sender<Candidate>,
    /// Paths reported or under observation. Pruned on removal.
    known: Arc<Mutex<HashSet<PathBuf>>>,
    rescan_needed: Arc<AtomicBool>,
}

impl LoopContext {
    async fn run(self, mut bridge_rx: mpsc::Receiver<notify::Event>) {
        let mut observers = JoinSet::new();

        if self.config.initial_scan {
            self.scan(&self.config.root, &mut observers);
        }

        loop {
            tokio::select! {
                event = bridge_rx.recv() => match event {
                    Some(event) => self.handle(event, &mut observers),
                    None => break,
                },
                Some(joined) = observers.join_next(), if !observers.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            warn!("stability observer panicked: {e}");
                        }
                    }
                }
            }

            if self.rescan_needed.swap(false, Ordering::Relaxed) {
                info!("rescanning watched folder");
                self.scan(&self.config.root, &mut observers);
            }
        }

        debug!("watcher event loop finished");
    }

    fn handle(&self, event: notify::Event, observers: &mut JoinSet<()>) {
        match event.kind {
            EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(_)) => {
                for path in event.paths {
                    self.consider(path, observers);
                }
            }
            EventKind::Remove(_) => {
                let mut known = self.known.lock();
                for path in &event.paths {
                    known.remove(path);
                }
            }
            _ => {}
        }
    }

    /// Report every visible file under `dir`.
    fn scan(&self, dir: &Path, observers: &mut JoinSet<()>) {
        let root = &self.config.root;
        let walker = WalkDir::new(dir)
            .into_iter()
            .filter_entry(|entry| !is_hidden(root, entry.path()));
        for entry in walker {
            match entry {
                Ok(entry) if entry.file_type().is_file() => {
                    self.consider(entry.into_path(), observers);
                }
                Ok(_) => {}
                Err(e) => warn!("scan error: {e}"),
            }
        }
    }

    fn consider(&self, path: PathBuf, observers: &mut JoinSet<()>) {
        if is_hidden(&self.config.root, &path) {
            return;
        }
        let meta = match std::fs::metadata(&path) {
            Ok(meta) => meta,
            Err(_) => {
                // Renamed away or deleted before we looked.
                self.known.lock().remove(&path);
                return;
            }
        };
        if meta.is_dir() {
            // Files moved in along with a directory produce no events of
            // their own.
            self.scan(&path, observers);
            return;
        }
        if !meta.is_file() || !self.known.lock().insert(path.clone()) {
            return;
        }

        debug!(path = %path.display(), "observing new file");
        observers.spawn(observe(
            path,
            self.config.stability_threshold,
            self.config.poll_interval,
            self.candidates.clone(),
            Arc::clone(&self.known),
        ));
    }
}

async fn observe(
    path: PathBuf,
    threshold: Duration,
    poll: Duration,
    candidates: mpsc::Sender<Candidate>,
    known: Arc<Mutex<HashSet<PathBuf>>>,
) {
    match stability::wait_until_stable(&path, threshold, poll).await {
        Ok(Some(size)) => {
            debug!(path = %path.display(), size, "file stable");
            if candidates.send(Candidate { path, size }).await.is_err() {
                debug!("candidate receiver closed");
            }
        }
        Ok(None) => {
            debug!(path = %path.display(), "file vanished before it settled");
            known.lock().remove(&path);
        }
        Err(e) => {
            warn!(path = %path.display(), "cannot stat file: {e}");
            known.lock().remove(&path);
        }
    }
}

/// Whether `path`, relative to `root`, is or lies inside a dot-entry.
pub fn is_hidden(root: &Path, path: &Path) -> bool {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative.components().any(|c| match c {
        Component::Normal(name) => name.to_string_lossy().starts_with('.'),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dot_files_and_dot_dirs_are_hidden() {
        let root = Path::new("/srv/in");
        assert!(is_hidden(root, Path::new("/srv/in/.partial.pdf")));
        assert!(is_hidden(root, Path::new("/srv/in/.tmp/a.pdf")));
        assert!(!is_hidden(root, Path::new("/srv/in/a.pdf")));
        assert!(!is_hidden(root, Path::new("/srv/in/sub/a.pdf")));
    }

    #[test]
    fn hidden_root_itself_does_not_hide_everything() {
        let root = Path::new("/home/me/.inbox");
        assert!(!is_hidden(root, Path::new("/home/me/.inbox/a.pdf")));
        assert!(!is_hidden(root, root));
    }
}
