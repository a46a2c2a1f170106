//! Observable lifecycle of a single watch request.
//!
//! Every watch starts `Pending` and leaves it exactly once, for `Satisfied`
//! (the awaited condition was observed), `Cancelled` (the caller stopped it) or
//! `Failed` (path rejected, resource gone, or I/O error). Observers are woken
//! through a `tokio::sync::watch` channel, so nothing polls for the outcome.
//!
//! # Example
//!
//! ```rust,ignore
//! use allocdir_common::watch_state::{WatchStateMachine, WatchState};
//!
//! let sm = WatchStateMachine::new();
//! sm.transition_to_satisfied().unwrap();
//!
//! let outcome = sm.wait_for_terminal().await;
//! assert_eq!(outcome, WatchState::Satisfied);
//! ```

use std::sync::Arc;
use tokio::sync::watch;

/// Watch request states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchState {
    /// Waiting for the watched condition
    Pending,

    /// The condition was observed (file exists, new bytes seen)
    Satisfied,

    /// The caller fired its cancellation signal
    Cancelled,

    /// The watch could not continue
    Failed { error: String },
}

impl WatchState {
    /// Returns true once the request has left `Pending`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WatchState::Pending)
    }
}

/// Watch state shared between the waiting task and any number of observers.
#[derive(Clone)]
pub struct WatchStateMachine {
    sender: Arc<watch::Sender<WatchState>>,
    // Keeps the channel open even when nobody subscribed yet
    _receiver: watch::Receiver<WatchState>,
}

impl std::fmt::Debug for WatchStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchStateMachine")
            .field("state", &*self.sender.borrow())
            .finish()
    }
}

impl WatchStateMachine {
    /// Create a new state machine in `Pending`.
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(WatchState::Pending);
        Self {
            sender: Arc::new(sender),
            _receiver: receiver,
        }
    }

    /// Current state without blocking.
    pub fn current(&self) -> WatchState {
        self.sender.borrow().clone()
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<WatchState> {
        self.sender.subscribe()
    }

    /// Pending -> Satisfied
    pub fn transition_to_satisfied(&self) -> Result<(), &'static str> {
        self.leave_pending(WatchState::Satisfied)
    }

    /// Pending -> Cancelled
    pub fn transition_to_cancelled(&self) -> Result<(), &'static str> {
        self.leave_pending(WatchState::Cancelled)
    }

    /// Pending -> Failed
    pub fn transition_to_failed(&self, error: impl Into<String>) -> Result<(), &'static str> {
        self.leave_pending(WatchState::Failed {
            error: error.into(),
        })
    }

    fn leave_pending(&self, next: WatchState) -> Result<(), &'static str> {
        let mut transitioned = false;
        self.sender.send_if_modified(|state| {
            if matches!(state, WatchState::Pending) {
                *state = next;
                transitioned = true;
                true
            } else {
                false
            }
        });
        if transitioned {
            Ok(())
        } else {
            Err("Watch request already left Pending")
        }
    }

    /// Wait until the request leaves `Pending` and return the terminal state.
    pub async fn wait_for_terminal(&self) -> WatchState {
        let mut rx = self.sender.subscribe();
        loop {
            {
                let state = rx.borrow_and_update();
                if state.is_terminal() {
                    return state.clone();
                }
            }
            if rx.changed().await.is_err() {
                return WatchState::Failed {
                    error: "watch state dropped".to_string(),
                };
            }
        }
    }
}

impl Default for WatchStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
