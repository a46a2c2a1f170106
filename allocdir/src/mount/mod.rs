//! # Shared Directory Exposure
//!
//! Makes the allocation's shared directory visible inside a task directory with
//! live write visibility in both directions: same backing storage, two paths.
//!
//! ## Platform Support
//!
//! - **Linux**: [`BindMounter`], a `MS_BIND` mount, detached on unmount.
//! - **Other Unix**: [`SymlinkMounter`], a symlink to the shared directory.
//! - **Everything else**: [`UnsupportedMounter`], which fails with
//!   `MountUnsupported`. There is no copy fallback; a copy would silently break
//!   write visibility.
//!
//! [`platform_mounter`] selects the implementation once, at startup.

#[cfg(target_os = "linux")]
mod bind;
#[cfg(unix)]
mod symlink;

#[cfg(target_os = "linux")]
pub use bind::BindMounter;
#[cfg(unix)]
pub use symlink::SymlinkMounter;

use std::path::Path;
use std::sync::Arc;

use crate::error::{AllocDirError, Result};

/// Bind-mount-class exposure of one directory at a second path.
pub trait Mounter: Send + Sync + std::fmt::Debug {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    /// Expose `source` at `target`. Creates whatever `target` needs to exist.
    fn mount(&self, source: &Path, target: &Path) -> Result<()>;

    /// Sever the exposure at `target` without touching the backing data.
    /// A target that is not (or no longer) exposed counts as success.
    fn unmount(&self, target: &Path) -> Result<()>;
}

/// Fails every mount; for platforms without a bind-mount primitive.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedMounter;

impl Mounter for UnsupportedMounter {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn mount(&self, _source: &Path, _target: &Path) -> Result<()> {
        Err(AllocDirError::MountUnsupported {
            platform: std::env::consts::OS,
        })
    }

    fn unmount(&self, _target: &Path) -> Result<()> {
        Ok(())
    }
}

/// The mounter for the platform this process runs on.
pub fn platform_mounter() -> Arc<dyn Mounter> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(BindMounter)
    }
    #[cfg(all(unix, not(target_os = "linux")))]
    {
        Arc::new(SymlinkMounter)
    }
    #[cfg(not(unix))]
    {
        Arc::new(UnsupportedMounter)
    }
}
