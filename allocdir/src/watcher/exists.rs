use std::path::{Path, PathBuf};
use std::time::Duration;

use allocdir_common::WatchStateMachine;
use notify::RecommendedWatcher;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{nearest_existing_dir, watch_dir_or_poll};
use crate::alloc_dir::AllocDir;
use crate::error::{AllocDirError, Result};

/// How a [`AllocDir::block_until_exists`] wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Exists,
    Cancelled,
}

impl AllocDir {
    /// Suspend until `path` exists inside the allocation or `cancel` fires,
    /// whichever happens first.
    ///
    /// Fails up front with `EscapesSandbox` or `SecretAccessProhibited`, and
    /// with `Destroyed` if the allocation is torn down while waiting.
    pub async fn block_until_exists(
        &self,
        path: impl AsRef<Path>,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome> {
        self.block_until_exists_tracked(path, cancel, &WatchStateMachine::new())
            .await
    }

    /// [`AllocDir::block_until_exists`], reporting progress on `status` the
    /// way a [`ChangeStream`](super::ChangeStream) does: `Satisfied` once the
    /// path exists, `Cancelled` on cancel, `Failed` on any error.
    ///
    /// Other tasks can observe the wait through
    /// [`WatchStateMachine::wait_for_terminal`] on a clone of `status`.
    pub async fn block_until_exists_tracked(
        &self,
        path: impl AsRef<Path>,
        cancel: &CancellationToken,
        status: &WatchStateMachine,
    ) -> Result<WaitOutcome> {
        let result = self.wait_until_exists(path.as_ref(), cancel).await;
        let _ = match &result {
            Ok(WaitOutcome::Exists) => status.transition_to_satisfied(),
            Ok(WaitOutcome::Cancelled) => status.transition_to_cancelled(),
            Err(e) => status.transition_to_failed(e.to_string()),
        };
        result
    }

    async fn wait_until_exists(&self, path: &Path, cancel: &CancellationToken) -> Result<WaitOutcome> {
        let target = self.resolver().resolve_readable(path)?;
        self.ensure_live()?;

        let teardown = self.teardown_token();
        let interval = self.config().watch_poll_interval();
        wait_for_path(&target, cancel, &teardown, interval).await
    }
}

async fn wait_for_path(
    target: &Path,
    cancel: &CancellationToken,
    teardown: &CancellationToken,
    interval: Duration,
) -> Result<WaitOutcome> {
    let (tx, mut rx) = mpsc::channel(1);
    let mut anchor: Option<(PathBuf, Option<RecommendedWatcher>)> = None;

    loop {
        if tokio::fs::symlink_metadata(target).await.is_ok() {
            tracing::trace!(path = %target.display(), "Watched path exists");
            return Ok(WaitOutcome::Exists);
        }

        // Re-anchor as intermediate directories appear
        if let Some(dir) = nearest_existing_dir(target)
            && anchor.as_ref().is_none_or(|(current, _)| current != dir)
        {
            anchor = Some((dir.to_path_buf(), watch_dir_or_poll(dir, &tx)));
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(WaitOutcome::Cancelled),
            _ = teardown.cancelled() => return Err(AllocDirError::Destroyed),
            _ = rx.recv() => {}
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
