//! Integration tests for the folder watcher.
//!
//! These use the real filesystem and OS notifications with short
//! stability thresholds.

use hopper::model::Candidate;
use hopper::watch::{FolderWatcher, WatchConfig};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(10);

fn config(root: &Path) -> WatchConfig {
    WatchConfig {
        stability_threshold: Duration::from_millis(200),
        poll_interval: Duration::from_millis(20),
        ..WatchConfig::new(root)
    }
}

/// Receive candidates until none arrives for `quiet`.
async fn collect(rx: &mut mpsc::Receiver<Candidate>, quiet: Duration) -> Vec<Candidate> {
    let mut seen = Vec::new();
    while let Ok(Some(candidate)) = tokio::time::timeout(quiet, rx.recv()).await {
        seen.push(candidate);
    }
    seen.sort_by(|a, b| a.path.cmp(&b.path));
    seen
}

#[tokio::test]
async fn initial_scan_reports_existing_visible_files() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    std::fs::create_dir(root.join("sub")).unwrap();
    std::fs::create_dir(root.join(".partial")).unwrap();
    std::fs::write(root.join("a.pdf"), b"12345").unwrap();
    std::fs::write(root.join("sub/c.pdf"), b"123").unwrap();
    std::fs::write(root.join(".hidden.pdf"), b"x").unwrap();
    std::fs::write(root.join(".partial/b.pdf"), b"x").unwrap();

    let (_watcher, mut rx) = FolderWatcher::start(config(root)).unwrap();
    let seen = collect(&mut rx, Duration::from_secs(1)).await;

    assert_eq!(
        seen,
        vec![
            Candidate {
                path: root.join("a.pdf"),
                size: 5
            },
            Candidate {
                path: root.join("sub/c.pdf"),
                size: 3
            },
        ]
    );
}

#[tokio::test]
async fn initial_scan_can_be_disabled() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("old.pdf"), b"x").unwrap();

    let mut cfg = config(dir.path());
    cfg.initial_scan = false;
    let (_watcher, mut rx) = FolderWatcher::start(cfg).unwrap();

    assert!(collect(&mut rx, Duration::from_millis(600)).await.is_empty());
}

#[tokio::test]
async fn new_file_is_reported_once_after_writes_stop() {
    let dir = tempfile::tempdir().unwrap();
    let (watcher, mut rx) = FolderWatcher::start(config(dir.path())).unwrap();
    assert_eq!(watcher.root(), dir.path());

    let path = dir.path().join("incoming.pdf");
    let mut file = std::fs::File::create(&path).unwrap();
    for _ in 0..5 {
        file.write_all(&[0u8; 1000]).unwrap();
        file.flush().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    drop(file);

    let candidate = tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("file reported in time")
        .expect("stream open");
    assert_eq!(candidate.path, path);
    assert_eq!(candidate.size, 5000);

    // Reported once, even though it was modified several times.
    assert!(collect(&mut rx, Duration::from_millis(600)).await.is_empty());
}

#[tokio::test]
async fn hidden_files_created_later_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let (_watcher, mut rx) = FolderWatcher::start(config(dir.path())).unwrap();

    std::fs::write(dir.path().join(".upload.tmp"), b"x").unwrap();
    std::fs::write(dir.path().join("visible.pdf"), b"x").unwrap();

    let seen = collect(&mut rx, Duration::from_secs(1)).await;
    let paths: Vec<PathBuf> = seen.into_iter().map(|c| c.path).collect();
    assert_eq!(paths, vec![dir.path().join("visible.pdf")]);
}

#[tokio::test]
async fn file_renamed_into_place_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let staging = tempfile::tempdir_in(dir.path().parent().unwrap_or(dir.path())).unwrap();
    let (_watcher, mut rx) = FolderWatcher::start(config(dir.path())).unwrap();

    let staged = staging.path().join("moved.pdf");
    std::fs::write(&staged, b"payload").unwrap();
    let target = dir.path().join("moved.pdf");
    std::fs::rename(&staged, &target).unwrap();

    let candidate = tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("file reported in time")
        .expect("stream open");
    assert_eq!(candidate.path, target);
    assert_eq!(candidate.size, 7);
}

#[tokio::test]
async fn stop_ends_the_candidate_stream() {
    let dir = tempfile::tempdir().unwrap();
    let (mut watcher, mut rx) = FolderWatcher::start(config(dir.path())).unwrap();

    watcher.stop();
    let end = tokio::time::timeout(WAIT, rx.recv()).await.expect("stream closes");
    assert!(end.is_none());
}
