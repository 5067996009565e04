//! Write-completion detection.
//!
//! A file counts as fully written once its size and modification time have
//! not changed for a whole stability threshold.

use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Snapshot {
    size: u64,
    modified: Option<SystemTime>,
}

async fn snapshot(path: &Path) -> io::Result<Option<Snapshot>> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(Some(Snapshot {
            size: meta.len(),
            modified: meta.modified().ok(),
        })),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Poll `path` every `poll` until it has been unchanged for `threshold`.
///
/// Returns the settled size, or `None` if the file disappeared meanwhile.
pub async fn wait_until_stable(
    path: &Path,
    threshold: Duration,
    poll: Duration,
) -> io::Result<Option<u64>> {
    let Some(mut last) = snapshot(path).await? else {
        return Ok(None);
    };
    let mut unchanged_since = Instant::now();

    loop {
        tokio::time::sleep(poll).await;

        let Some(current) = snapshot(path).await? else {
            return Ok(None);
        };
        if current != last {
            last = current;
            unchanged_since = Instant::now();
            continue;
        }
        if unchanged_since.elapsed() >= threshold {
            return Ok(Some(last.size));
        }
    }
}
