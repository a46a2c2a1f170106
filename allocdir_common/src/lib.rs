//! Shared building blocks for the allocation directory crates.
//!
//! - [`state_machine`]: a mutex-guarded state cell with closure-scoped transitions.
//! - [`watch_state`]: the observable lifecycle of a single watch request.

pub mod state_machine;
pub mod watch_state;

pub use state_machine::StateMachine;
pub use watch_state::{WatchState, WatchStateMachine};
