//! # Allocation Directory Configuration
//!
//! Directory modes and watcher tuning live here so a platform or policy change
//! is a single edit. Layout names (the on-disk convention a restarted agent
//! relies on to reattach) are constants, not configuration.
//!
//! A config file is plain TOML; every key is optional:
//!
//! ```toml
//! watch_poll_interval_ms = 100
//!
//! [dir_modes]
//! secrets = 0o700
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Name of the shared allocation area inside the root, and of its exposure
/// inside every task directory.
pub const SHARED_ALLOC_NAME: &str = "alloc";
/// Persisted data subarea of the shared directory.
pub const SHARED_DATA_DIR: &str = "data";
/// Log subarea of the shared directory.
pub const SHARED_LOG_DIR: &str = "logs";
/// Scratch subarea of the shared directory.
pub const SHARED_TMP_DIR: &str = "tmp";

/// Task-local writable scratch space.
pub const TASK_LOCAL: &str = "local";
/// Task secrets area.
pub const TASK_SECRETS: &str = "secrets";
/// Task log area.
pub const TASK_LOGS: &str = "logs";

pub const ROOT_DIR_MODE: u32 = 0o755;
pub const SHARED_DIR_MODE: u32 = 0o777;
pub const TASK_DIR_MODE: u32 = 0o777;
pub const SECRETS_DIR_MODE: u32 = 0o700;

pub const DEFAULT_WATCH_POLL_INTERVAL_MS: u64 = 250;
/// Upper bound for the polling fallback so a cancelled or destroyed watch
/// never waits longer than this between checks.
pub const MAX_WATCH_POLL_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_CHANGE_EVENT_BUFFER: usize = 16;

/// Permission bits applied (explicitly, bypassing the umask) when building.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DirModes {
    pub root: u32,
    pub shared: u32,
    pub task: u32,
    pub secrets: u32,
}

impl Default for DirModes {
    fn default() -> Self {
        Self {
            root: ROOT_DIR_MODE,
            shared: SHARED_DIR_MODE,
            task: TASK_DIR_MODE,
            secrets: SECRETS_DIR_MODE,
        }
    }
}

/// Configuration shared by every `AllocDir` an agent creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AllocDirConfig {
    pub dir_modes: DirModes,
    /// Polling fallback for watchers, in milliseconds.
    pub watch_poll_interval_ms: u64,
    /// Channel depth between a change watcher and its stream.
    pub change_event_buffer: usize,
}

impl Default for AllocDirConfig {
    fn default() -> Self {
        Self {
            dir_modes: DirModes::default(),
            watch_poll_interval_ms: DEFAULT_WATCH_POLL_INTERVAL_MS,
            change_event_buffer: DEFAULT_CHANGE_EVENT_BUFFER,
        }
    }
}

impl AllocDirConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("Failed to parse allocation directory config")
    }

    /// Load a TOML config file.
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_toml_str(&contents)?;
        tracing::debug!(path = %path.display(), ?config, "Loaded allocation directory config");
        Ok(config)
    }

    /// Polling fallback interval, clamped to `1..=MAX_WATCH_POLL_INTERVAL_MS`.
    pub fn watch_poll_interval(&self) -> Duration {
        Duration::from_millis(
            self.watch_poll_interval_ms
                .clamp(1, MAX_WATCH_POLL_INTERVAL_MS),
        )
    }

    pub(crate) fn change_event_buffer(&self) -> usize {
        self.change_event_buffer.max(1)
    }
}
