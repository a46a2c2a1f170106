use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};

use allocdir_common::WatchStateMachine;
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use super::{nearest_existing_dir, watch_dir_or_poll};
use crate::alloc_dir::AllocDir;
use crate::error::{AllocDirError, Result};

/// One notification from a [`ChangeStream`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeEvent {
    /// New bytes were written; `size` is the current length.
    Modified { size: u64 },
    /// The file shrank to `size`.
    Truncated { size: u64 },
    /// Another file was renamed over the watched path.
    Renamed,
    /// The file (or the whole allocation) is gone.
    Removed,
    Cancelled,
    Error { message: String },
}

impl ChangeEvent {
    /// No further events follow a terminal one.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChangeEvent::Removed | ChangeEvent::Cancelled | ChangeEvent::Error { .. }
        )
    }
}

/// Lazy, non-restartable sequence of [`ChangeEvent`]s for one file.
///
/// Ends after its terminal event. Cancellation and allocation teardown are
/// reported on the next poll, ahead of any events still queued. Dropping the
/// stream stops the background watch.
#[derive(Debug)]
pub struct ChangeStream {
    rx: mpsc::Receiver<ChangeEvent>,
    status: WatchStateMachine,
    stop: CancellationToken,
    teardown: CancellationToken,
    finished: bool,
    _stop_guard: DropGuard,
}

impl ChangeStream {
    /// `Satisfied` after the first change, `Cancelled` or `Failed` otherwise.
    pub fn status(&self) -> &WatchStateMachine {
        &self.status
    }

    pub async fn next_event(&mut self) -> Option<ChangeEvent> {
        StreamExt::next(self).await
    }
}

impl Stream for ChangeStream {
    type Item = ChangeEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        let event = if this.stop.is_cancelled() {
            let _ = this.status.transition_to_cancelled();
            ChangeEvent::Cancelled
        } else if this.teardown.is_cancelled() {
            let _ = this.status.transition_to_failed("allocation destroyed");
            ChangeEvent::Removed
        } else {
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(event)) => event,
                Poll::Ready(None) => {
                    this.finished = true;
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        };

        if event.is_terminal() {
            this.finished = true;
            this.rx.close();
        }
        Poll::Ready(Some(event))
    }
}

impl AllocDir {
    /// Stream changes to an existing file, starting logically at
    /// `from_offset`.
    ///
    /// If the file is already longer than `from_offset` the first event is
    /// `Modified`; if it is shorter, `Truncated`. The stream ends with
    /// `Cancelled` when `cancel` fires and with `Removed` when the file or the
    /// allocation goes away.
    pub async fn change_events(
        &self,
        path: impl AsRef<Path>,
        from_offset: u64,
        cancel: &CancellationToken,
    ) -> Result<ChangeStream> {
        let requested = path.as_ref();
        let target = self.resolver().resolve_readable(requested)?;
        self.ensure_live()?;
        let physical = self
            .resolver()
            .confine_existing(&target, &requested.to_string_lossy())?;
        let meta = tokio::fs::metadata(&physical)
            .await
            .map_err(|e| AllocDirError::io("stat", requested, e))?;

        let (tx, rx) = mpsc::channel(self.config().change_event_buffer());
        let status = WatchStateMachine::new();
        let stop = cancel.child_token();

        let teardown = self.teardown_token();

        let watch = ChangeWatch {
            target,
            last: FileState::from(&meta),
            tx,
            status: status.clone(),
            stop: stop.clone(),
            teardown: teardown.clone(),
            interval: self.config().watch_poll_interval(),
        };
        tokio::spawn(watch.run(from_offset));

        Ok(ChangeStream {
            rx,
            status,
            stop: stop.clone(),
            teardown,
            finished: false,
            _stop_guard: stop.drop_guard(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileState {
    id: u64,
    size: u64,
    modified: Option<SystemTime>,
}

impl From<&Metadata> for FileState {
    fn from(meta: &Metadata) -> Self {
        #[cfg(unix)]
        let id = std::os::unix::fs::MetadataExt::ino(meta);
        #[cfg(not(unix))]
        let id = 0;
        Self {
            id,
            size: meta.len(),
            modified: meta.modified().ok(),
        }
    }
}

/// The event describing the step from `prev` to `next`, if any.
fn classify(prev: &FileState, next: &FileState) -> Option<ChangeEvent> {
    if next.id != prev.id {
        Some(ChangeEvent::Renamed)
    } else if next.size < prev.size {
        Some(ChangeEvent::Truncated { size: next.size })
    } else if next.size > prev.size || next.modified != prev.modified {
        Some(ChangeEvent::Modified { size: next.size })
    } else {
        None
    }
}

struct ChangeWatch {
    target: PathBuf,
    last: FileState,
    tx: mpsc::Sender<ChangeEvent>,
    status: WatchStateMachine,
    stop: CancellationToken,
    teardown: CancellationToken,
    interval: Duration,
}

impl ChangeWatch {
    async fn run(mut self, from_offset: u64) {
        let initial = if from_offset < self.last.size {
            Some(ChangeEvent::Modified { size: self.last.size })
        } else if from_offset > self.last.size {
            Some(ChangeEvent::Truncated { size: self.last.size })
        } else {
            None
        };
        if let Some(event) = initial
            && !self.emit(event).await
        {
            return;
        }

        let (wake_tx, mut wake_rx) = mpsc::channel(1);
        let _watcher = nearest_existing_dir(self.target.parent().unwrap_or(&self.target))
            .and_then(|dir| watch_dir_or_poll(dir, &wake_tx));

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    self.emit(ChangeEvent::Cancelled).await;
                    return;
                }
                _ = self.teardown.cancelled() => {
                    self.emit(ChangeEvent::Removed).await;
                    return;
                }
                _ = self.tx.closed() => return,
                _ = wake_rx.recv() => {}
                _ = tokio::time::sleep(self.interval) => {}
            }

            let event = match tokio::fs::metadata(&self.target).await {
                Ok(meta) => {
                    let next = FileState::from(&meta);
                    let event = classify(&self.last, &next);
                    self.last = next;
                    event
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => Some(ChangeEvent::Removed),
                Err(e) => Some(ChangeEvent::Error {
                    message: e.to_string(),
                }),
            };
            if let Some(event) = event {
                let terminal = event.is_terminal();
                if !self.emit(event).await || terminal {
                    return;
                }
            }
        }
    }

    /// Record the event in the watch state and deliver it. Returns false once
    /// the stream was dropped, or when a full channel is still full at cancel
    /// or teardown (the stream reports those itself).
    async fn emit(&self, event: ChangeEvent) -> bool {
        let _ = match &event {
            ChangeEvent::Cancelled => self.status.transition_to_cancelled(),
            ChangeEvent::Removed => self.status.transition_to_failed("file removed"),
            ChangeEvent::Error { message } => self.status.transition_to_failed(message.clone()),
            _ => self.status.transition_to_satisfied(),
        };
        tracing::trace!(path = %self.target.display(), ?event, "Change event");
        tokio::select! {
            biased;
            sent = self.tx.send(event) => sent.is_ok(),
            _ = self.stop.cancelled() => false,
            _ = self.teardown.cancelled() => false,
        }
    }
}
