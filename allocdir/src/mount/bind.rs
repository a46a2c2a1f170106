use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use std::io;
use std::path::Path;

use super::Mounter;
use crate::error::{AllocDirError, IoContext, Result};

/// Linux bind mounts. Requires `CAP_SYS_ADMIN`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BindMounter;

impl BindMounter {
    /// Whether this process can be expected to bind mount at all.
    pub fn is_supported() -> bool {
        nix::unistd::Uid::effective().is_root()
    }
}

impl Mounter for BindMounter {
    fn name(&self) -> &'static str {
        "bind"
    }

    fn mount(&self, source: &Path, target: &Path) -> Result<()> {
        std::fs::create_dir_all(target).io_context("create mount point", target)?;
        mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|errno| AllocDirError::io("bind mount", target, io::Error::from(errno)))?;
        tracing::debug!(source = %source.display(), target = %target.display(), "Bind mounted shared directory");
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        match umount2(target, MntFlags::MNT_DETACH) {
            Ok(()) => {
                tracing::debug!(target = %target.display(), "Unmounted shared directory");
                Ok(())
            }
            // Not a mount point, or already gone
            Err(Errno::EINVAL) | Err(Errno::ENOENT) => Ok(()),
            Err(errno) => Err(AllocDirError::io("unmount", target, io::Error::from(errno))),
        }
    }
}
