//! Copy host directory trees into a task directory.
//!
//! File content, permission bits and symlinks are preserved. Directories that
//! have to be created on the way to a destination take the mode of the host
//! directory at the same path: embedding into `usr/lib` creates `usr` with the
//! mode of the host's `/usr`. A level with no host counterpart gets the task
//! directory mode.
//!
//! Destinations that already exist are kept, so embedding the same mapping
//! again is a no-op. Nothing is ever written through a symlink found inside
//! the task directory.
//!
//! Not transactional: a failure leaves the partial copy in place.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

use crate::alloc_dir::AllocDir;
use crate::error::{AllocDirError, IoContext, Result};
use crate::fs_util;
use crate::path_security;

/// Every ancestor of an absolute `path` (itself included) with its mode,
/// filesystem root first.
pub fn split_path(path: &Path) -> Result<Vec<(PathBuf, u32)>> {
    let mut chain = Vec::new();
    for ancestor in path.ancestors().filter(|a| !a.as_os_str().is_empty()) {
        let meta = fs::metadata(ancestor).io_context("stat", ancestor)?;
        chain.push((ancestor.to_path_buf(), fs_util::mode_of(&meta)));
    }
    chain.reverse();
    Ok(chain)
}

/// Recreate the directory chain of `host_path` under `base`, each created
/// level taking the mode of its host counterpart. Existing levels are kept.
pub fn create_dir_chain(base: &Path, host_path: &Path) -> Result<()> {
    let host_path = std::path::absolute(host_path).io_context("resolve", host_path)?;
    let mut created = Vec::new();
    for (host_dir, mode) in split_path(&host_path)? {
        let rel = host_dir.strip_prefix("/").unwrap_or(&host_dir);
        if rel.as_os_str().is_empty() {
            continue;
        }
        create_level(&base.join(rel), mode, &mut created)?;
    }
    apply_modes(&created)
}

/// Mode of the host directory at `host_path`, or `default_mode` when the host
/// has no directory there.
fn host_dir_mode(host_path: &Path, default_mode: u32) -> u32 {
    match fs::metadata(host_path) {
        Ok(meta) if meta.is_dir() => fs_util::mode_of(&meta),
        _ => default_mode,
    }
}

/// Create `base/dest_rel` level by level. Each level mirrors the mode of the
/// host directory at `/<dest prefix>`.
fn create_mirrored_chain(
    base: &Path,
    dest_rel: &Path,
    default_mode: u32,
    created: &mut Vec<(PathBuf, u32)>,
) -> Result<()> {
    let mut host = PathBuf::from("/");
    let mut current = base.to_path_buf();
    for component in dest_rel.components() {
        let Component::Normal(name) = component else {
            continue;
        };
        host.push(name);
        current.push(name);
        create_level(&current, host_dir_mode(&host, default_mode), created)?;
    }
    Ok(())
}

/// Create one level owner-writable and queue its final mode on `created` for
/// [`apply_modes`]. Existing directories are left alone; symlinks are refused.
fn create_level(path: &Path, mode: u32, created: &mut Vec<(PathBuf, u32)>) -> Result<()> {
    if fs_util::create_dir_with_mode(path, mode | 0o700)? {
        tracing::trace!(dir = %path.display(), mode = format_args!("{mode:o}"), "Created embed directory");
        created.push((path.to_path_buf(), mode));
    }
    Ok(())
}

/// Apply final modes, deepest directory first so a read-only parent does not
/// block its children.
fn apply_modes(created: &[(PathBuf, u32)]) -> Result<()> {
    for (dir, mode) in created.iter().rev() {
        fs_util::set_mode(dir, *mode)?;
    }
    Ok(())
}

impl AllocDir {
    /// Copy each host source into `<task>/<dest>`.
    ///
    /// Sources that do not exist on the host are skipped. A regular-file source
    /// is copied to exactly `dest`. Absolute destinations are taken relative to
    /// the task directory (`/bin` lands in `<task>/bin`).
    ///
    /// A destination that physically resolves outside the allocation, through
    /// a symlink planted in the task directory, is rejected with
    /// `EscapesSandbox` before anything is written.
    pub fn embed<I, S, D>(&self, task: &str, mapping: I) -> Result<()>
    where
        I: IntoIterator<Item = (S, D)>,
        S: AsRef<Path>,
        D: AsRef<Path>,
    {
        self.ensure_live()?;
        let task_dir = self.built_task_dir(task)?;
        let default_mode = self.config().dir_modes.task;

        for (source, dest) in mapping {
            let source = source.as_ref();
            let source = &std::path::absolute(source).io_context("resolve", source)?;
            let dest = dest.as_ref();
            let dest_rel = dest.strip_prefix("/").unwrap_or(dest);

            let source_meta = match fs::metadata(source) {
                Ok(meta) => meta,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    tracing::debug!(task, source = %source.display(), "Embed source missing on host, skipping");
                    continue;
                }
                Err(e) => return Err(AllocDirError::io("stat", source, e)),
            };

            let target = path_security::resolve(task_dir.dir(), dest_rel)?;
            self.resolver()
                .confine_nearest_existing(&target, &dest.to_string_lossy())?;
            let target_rel = target
                .strip_prefix(task_dir.dir())
                .map(Path::to_path_buf)
                .unwrap_or_default();

            let mut created = Vec::new();
            if source_meta.is_dir() {
                create_mirrored_chain(task_dir.dir(), &target_rel, default_mode, &mut created)?;
                copy_tree(source, &target, &mut created)?;
            } else {
                let parent_rel = target_rel.parent().unwrap_or(Path::new(""));
                create_mirrored_chain(task_dir.dir(), parent_rel, default_mode, &mut created)?;
                copy_file(source, &target)?;
            }
            apply_modes(&created)?;
            tracing::debug!(task, source = %source.display(), dest = %dest.display(), "Embedded host path");
        }
        Ok(())
    }
}

/// Copy the contents of `source` into the existing directory `target`.
///
/// Directories are created owner-writable so their children can be written;
/// their host modes are queued on `created`.
fn copy_tree(source: &Path, target: &Path, created: &mut Vec<(PathBuf, u32)>) -> Result<()> {
    for entry in WalkDir::new(source).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(source).to_path_buf();
            AllocDirError::io("walk", path, io::Error::other(e))
        })?;
        let rel = entry
            .path()
            .strip_prefix(source)
            .map_err(|_| AllocDirError::io("walk", entry.path(), io::Error::other("outside source")))?;
        let dest = target.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            let meta = entry
                .metadata()
                .map_err(|e| AllocDirError::io("stat", entry.path(), io::Error::other(e)))?;
            create_level(&dest, fs_util::mode_of(&meta), created)?;
        } else if file_type.is_file() {
            copy_file(entry.path(), &dest)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &dest)?;
        } else {
            tracing::debug!(path = %entry.path().display(), "Skipping special file while embedding");
        }
    }
    Ok(())
}

/// Copy a regular file unless something (a file or a link) already sits at
/// `dest`. `fs::copy` would write through a link.
fn copy_file(source: &Path, dest: &Path) -> Result<()> {
    if fs::symlink_metadata(dest).is_ok() {
        tracing::trace!(dest = %dest.display(), "Embed destination exists, keeping it");
        return Ok(());
    }
    fs::copy(source, dest).io_context("copy", source)?;
    Ok(())
}

/// Recreate the link at `source` with the same target text.
#[cfg(unix)]
fn copy_symlink(source: &Path, dest: &Path) -> Result<()> {
    if fs::symlink_metadata(dest).is_ok() {
        return Ok(());
    }
    let link_target = fs::read_link(source).io_context("read link", source)?;
    std::os::unix::fs::symlink(&link_target, dest).io_context("create symlink", dest)
}

#[cfg(not(unix))]
fn copy_symlink(source: &Path, _dest: &Path) -> Result<()> {
    tracing::debug!(path = %source.display(), "Skipping symlink while embedding");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_path_counts_every_ancestor() {
        let temp = tempfile::tempdir().unwrap();
        let dest = temp.path().join("foo/bar/baz");
        fs::create_dir_all(&dest).unwrap();

        let chain = split_path(&dest).unwrap();
        assert_eq!(chain.len(), dest.ancestors().count());
        assert_eq!(chain.first().unwrap().0, PathBuf::from("/"));
        assert_eq!(chain.last().unwrap().0, dest);
    }

    #[cfg(unix)]
    #[test]
    fn test_create_dir_chain_copies_modes() {
        let host = tempfile::tempdir().unwrap();
        let subdir = host.path().join("subdir");
        fs::create_dir(&subdir).unwrap();
        fs_util::set_mode(&subdir, 0o760).unwrap();

        let base = tempfile::tempdir().unwrap();
        create_dir_chain(base.path(), &subdir).unwrap();

        let rel = subdir.strip_prefix("/").unwrap();
        let copied = fs::metadata(base.path().join(rel)).unwrap();
        assert_eq!(fs_util::mode_of(&copied), 0o760);
    }

    #[cfg(unix)]
    #[test]
    fn test_mirrored_chain_uses_host_dir_at_destination() {
        let host = tempfile::tempdir().unwrap();
        let opt = host.path().join("opt");
        fs::create_dir(&opt).unwrap();
        fs_util::set_mode(&opt, 0o711).unwrap();

        let base = tempfile::tempdir().unwrap();
        // Mirrors an existing host directory, then goes below anything the host has
        let dest = opt.strip_prefix("/").unwrap().join("not-on-host");
        let mut created = Vec::new();
        create_mirrored_chain(base.path(), &dest, 0o750, &mut created).unwrap();
        apply_modes(&created).unwrap();

        let mirrored = fs::metadata(base.path().join(opt.strip_prefix("/").unwrap())).unwrap();
        assert_eq!(fs_util::mode_of(&mirrored), 0o711);
        let fallback = fs::metadata(base.path().join(&dest)).unwrap();
        assert_eq!(fs_util::mode_of(&fallback), 0o750);
    }
}
