//! # Logging Initialization
//!
//! A single entry point, [`init_logging`], installs the global `tracing`
//! subscriber for a process embedding this crate. Library code only ever emits
//! events; it never installs a subscriber on its own.
//!
//! - **Filter**: `RUST_LOG` when set, otherwise `"{log_level},allocdir=debug"`.
//! - **File output** (`log_to_file = true`): daily rolling file in the user
//!   cache directory (resolved with `directories`), written through a
//!   non-blocking `tracing_appender` worker, ANSI disabled.
//! - **Stderr output**: used when requested, or as the fallback when the cache
//!   directory cannot be resolved or written. ANSI enabled.
//!
//! Initialization runs once per process (`std::sync::Once`); later calls are
//! no-ops.

use anyhow::Result;
use directories::ProjectDirs;
use std::{io::stderr, path::Path, sync::Once};
use tracing_subscriber::{EnvFilter, fmt::layer, prelude::*};

static INIT: Once = Once::new();

/// Log file name prefix inside the cache directory.
pub const LOG_FILE_NAME: &str = "allocdir.log";

/// Initialize verbose logging for tests (trace level, stderr).
pub fn init_test_logging() {
    // Stderr logging has no fallible step
    let _ = init_logging("trace", false);
}

/// Default filter directive used when `RUST_LOG` is not set.
pub fn default_filter(log_level: &str) -> String {
    format!("{log_level},allocdir=debug")
}

/// Initializes the logging system.
///
/// # Errors
///
/// Currently infallible; the `Result` leaves room for exporters that can fail.
pub fn init_logging(log_level: &str, log_to_file: bool) -> Result<()> {
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_filter(log_level)));

        if log_to_file
            && let Some(proj_dirs) = ProjectDirs::from("io", "AllocDir", "allocdir")
        {
            let log_dir = proj_dirs.cache_dir();

            // tracing_appender::rolling::daily panics on permission errors
            if can_write_to(log_dir) {
                let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_NAME);
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(layer().with_writer(non_blocking).with_ansi(false))
                    .init();
                // Leaked so buffered lines are flushed for the life of the process
                Box::leak(Box::new(guard));
                return;
            }
        }

        tracing_subscriber::registry()
            .with(env_filter)
            .with(layer().with_writer(stderr).with_ansi(true))
            .init();
    });

    Ok(())
}

/// Create `dir` if needed and verify a file can be written and removed in it.
fn can_write_to(dir: &Path) -> bool {
    if std::fs::create_dir_all(dir).is_err() {
        return false;
    }

    let probe = dir.join(".allocdir_log_probe");
    match std::fs::write(&probe, "probe") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_format() {
        assert_eq!(default_filter("info"), "info,allocdir=debug");
        assert_eq!(default_filter("trace"), "trace,allocdir=debug");
    }

    #[test]
    fn test_can_write_to_temp_dir() {
        let temp = tempfile::tempdir().unwrap();
        let nested = temp.path().join("a/b");
        assert!(can_write_to(&nested));
        assert!(nested.is_dir());
        assert!(!nested.join(".allocdir_log_probe").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_can_write_to_rejects_file_path() {
        let temp = tempfile::tempdir().unwrap();
        let file = temp.path().join("plain");
        std::fs::write(&file, "x").unwrap();
        assert!(!can_write_to(&file.join("sub")));
    }

    #[test]
    fn test_init_logging_is_idempotent() {
        init_test_logging();
        init_test_logging();
        assert!(init_logging("debug", false).is_ok());
    }
}
