use std::io;
use std::path::Path;

use super::Mounter;
use crate::error::{AllocDirError, IoContext, Result};

/// Exposes the shared directory through a symlink.
///
/// Reads and writes through the link land in the same backing directory, and
/// removing the link leaves the data in place. Needs no privileges.
#[derive(Debug, Default, Clone, Copy)]
pub struct SymlinkMounter;

impl Mounter for SymlinkMounter {
    fn name(&self) -> &'static str {
        "symlink"
    }

    fn mount(&self, source: &Path, target: &Path) -> Result<()> {
        match std::fs::symlink_metadata(target) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                std::os::unix::fs::symlink(source, target).io_context("symlink", target)?;
                tracing::debug!(source = %source.display(), target = %target.display(), "Linked shared directory");
                Ok(())
            }
            Err(e) => Err(AllocDirError::io("inspect mount point", target, e)),
            Ok(meta)
                if meta.file_type().is_symlink()
                    && std::fs::read_link(target).ok().as_deref() == Some(source) =>
            {
                Ok(())
            }
            Ok(_) => Err(AllocDirError::AlreadyExists {
                path: target.to_path_buf(),
            }),
        }
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        match std::fs::symlink_metadata(target) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AllocDirError::io("inspect mount point", target, e)),
            Ok(meta) if meta.file_type().is_symlink() => {
                std::fs::remove_file(target).io_context("unlink", target)
            }
            Ok(_) => {
                tracing::debug!(target = %target.display(), "Not a shared directory link, leaving in place");
                Ok(())
            }
        }
    }
}
