//! # Cancellable File Watching
//!
//! Two asynchronous primitives used to serve logs and files remotely:
//!
//! - [`AllocDir::block_until_exists`](crate::AllocDir::block_until_exists)
//!   suspends until a path appears.
//! - [`AllocDir::change_events`](crate::AllocDir::change_events) streams
//!   append, truncate and rename notifications for one file.
//!
//! Both resolve the path with the same escape and secrets rules as the read
//! API before waiting. Waiting is driven by `notify` events on the nearest
//! existing directory, backed by a bounded polling interval so a missed or
//! unsupported notification never stalls a watch. Neither primitive holds a
//! lock on the allocation while suspended; `destroy` wakes both through the
//! allocation's teardown token.

mod changes;
mod exists;

pub use changes::{ChangeEvent, ChangeStream};
pub use exists::WaitOutcome;

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use tokio::sync::mpsc;

use crate::error::Result;

/// Watch `dir` (non-recursively) and signal `tx` on every event.
///
/// The channel only carries a wake-up; receivers re-stat the filesystem, so
/// a full channel simply drops the redundant signal.
fn watch_dir(dir: &Path, tx: mpsc::Sender<()>) -> Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if res.is_ok() {
            let _ = tx.try_send(());
        }
    })?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

/// Like [`watch_dir`], degrading to polling (no watcher) on failure.
fn watch_dir_or_poll(dir: &Path, tx: &mpsc::Sender<()>) -> Option<RecommendedWatcher> {
    match watch_dir(dir, tx.clone()) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            tracing::debug!(dir = %dir.display(), error = %e, "Falling back to polling");
            None
        }
    }
}

/// The closest ancestor of `path` (itself included) that is a directory.
fn nearest_existing_dir(path: &Path) -> Option<&Path> {
    path.ancestors().find(|p| p.is_dir())
}
