//! # Allocation Directory Manager
//!
//! Creates, secures, migrates and tears down the filesystem sandbox each
//! scheduled task of an allocation runs inside.
//!
//! ## On-disk Layout
//!
//! ```text
//! <root>/
//!   alloc/            shared directory, visible to every task
//!     data/           persisted across task restarts and migrations
//!     logs/
//!     tmp/
//!   <task>/
//!     alloc/          exposure of <root>/alloc (bind mount or symlink)
//!     local/          persisted task scratch space
//!     secrets/        never served remotely, never archived
//!     logs/
//! ```
//!
//! The layout is stable across agent restarts so a restarted agent can
//! reattach to existing allocations.
//!
//! ## Lifecycle
//!
//! An [`AllocDir`] is described in memory first. Task names are registered
//! with [`AllocDir::new_task_dir`] (no I/O) and materialized by
//! [`AllocDir::build`], which may be called repeatedly as tasks are admitted.
//! [`AllocDir::destroy`] is terminal: it unmounts every exposure, removes the
//! tree, and wakes any pending watcher.
//!
//! ## Security Boundary
//!
//! [`AllocDir::list`], [`AllocDir::stat`] and [`AllocDir::read_at`] are the only
//! operations a remote file API may call. Every path goes through the
//! [`PathResolver`]: lexical escape check, secrets check, then physical
//! confinement of the existing target. Security errors carry only the caller's
//! path, never the allocation root.
//!
//! ## Modules
//!
//! - **`alloc_dir`**: allocation bookkeeping, `build`, mounting and `destroy`.
//! - **`task_dir`**: per-task directory descriptor and name validation.
//! - **`path_security`**: lexical resolution and secrets classification.
//! - **`fs_api`**: the read-only file API (`list`, `stat`, `read_at`).
//! - **`embed`**: copying host trees into a task with matching permissions.
//! - **`mount`**: the [`Mounter`] abstraction and platform implementations.
//! - **`snapshot`**: tar snapshot and restore of the persisted regions.
//! - **`mover`**: node-local migration between allocations.
//! - **`watcher`**: cancellable existence waits and change streams.
//! - **`config`**: directory modes, watcher tuning and layout names.
//! - **`utils`**: logging initialization and time formatting.

pub mod alloc_dir;
pub mod config;
pub mod embed;
pub mod error;
pub mod fs_api;
mod fs_util;
pub mod mount;
pub mod mover;
pub mod path_security;
pub mod snapshot;
pub mod task_dir;
pub mod utils;
pub mod watcher;

// Re-export main types for easier use
pub use alloc_dir::AllocDir;
pub use config::{AllocDirConfig, DirModes};
pub use embed::{create_dir_chain, split_path};
pub use error::{AllocDirError, Result};
pub use fs_api::AllocFileInfo;
pub use mount::{Mounter, UnsupportedMounter, platform_mounter};
pub use path_security::PathResolver;
pub use task_dir::TaskDir;
pub use watcher::{ChangeEvent, ChangeStream, WaitOutcome};

pub use allocdir_common::{WatchState, WatchStateMachine};
