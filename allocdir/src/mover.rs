//! Node-local migration of persisted state between allocations.
//!
//! Contents of `alloc/data` and of each named task's `local` directory are
//! renamed into the destination. When the destination already has a
//! directory of the same name the two are merged; files from the source
//! replace existing files. Across filesystems the rename falls back to copy
//! then remove.
//!
//! The source allocation itself is left in place. Deleting it is a separate
//! `destroy` call.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::alloc_dir::AllocDir;
use crate::error::{AllocDirError, IoContext, Result};
use crate::fs_util;

impl AllocDir {
    /// Move the persisted contents of `source` into this (already built)
    /// allocation. Every named task must be built on both sides.
    pub fn move_from(&self, source: &AllocDir, tasks: &[&str]) -> Result<()> {
        self.ensure_live()?;
        source.ensure_live()?;

        let mut pairs: Vec<(PathBuf, PathBuf)> = vec![(source.data_dir(), self.data_dir())];
        for task in tasks {
            let from = source.built_task_dir(task)?;
            let to = self.built_task_dir(task)?;
            pairs.push((from.local_dir().to_path_buf(), to.local_dir().to_path_buf()));
        }

        for (from, to) in &pairs {
            move_contents(from, to)?;
        }

        tracing::info!(
            from = %source.root().display(),
            to = %self.root().display(),
            ?tasks,
            "Moved allocation data"
        );
        Ok(())
    }
}

fn move_contents(from: &Path, to: &Path) -> Result<()> {
    let entries = match fs::read_dir(from) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(AllocDirError::io("list", from, e)),
    };
    for entry in entries {
        let entry = entry.io_context("list", from)?;
        move_entry(&entry.path(), &to.join(entry.file_name()))?;
    }
    Ok(())
}

fn move_entry(from: &Path, to: &Path) -> Result<()> {
    let from_meta = fs::symlink_metadata(from).io_context("stat", from)?;
    match fs::symlink_metadata(to) {
        Ok(to_meta) if to_meta.is_dir() && from_meta.is_dir() => {
            move_contents(from, to)?;
            return fs::remove_dir(from).io_context("remove", from);
        }
        Ok(to_meta) if to_meta.is_dir() => {
            fs::remove_dir_all(to).io_context("remove", to)?;
        }
        Ok(_) if from_meta.is_dir() => {
            fs::remove_file(to).io_context("remove", to)?;
        }
        // rename(2) replaces a file target atomically
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(AllocDirError::io("stat", to, e)),
    }

    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            tracing::debug!(from = %from.display(), to = %to.display(), "Rename crosses devices, copying");
            copy_then_remove(from, to, &from_meta)
        }
        Err(e) => Err(AllocDirError::io("rename", from, e)),
    }
}

fn copy_then_remove(from: &Path, to: &Path, from_meta: &fs::Metadata) -> Result<()> {
    if !from_meta.is_dir() {
        copy_entry(from, to, from_meta)?;
        return fs::remove_file(from).io_context("remove", from);
    }

    let mut dirs = Vec::new();
    for entry in WalkDir::new(from).follow_links(false) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(from).to_path_buf();
            AllocDirError::io("walk", path, io::Error::other(e))
        })?;
        let rel = entry.path().strip_prefix(from).unwrap_or(Path::new(""));
        let target = to.join(rel);
        let meta = fs::symlink_metadata(entry.path()).io_context("stat", entry.path())?;
        if meta.is_dir() {
            fs_util::create_dir_with_mode(&target, fs_util::mode_of(&meta) | 0o700)?;
            dirs.push((target, fs_util::mode_of(&meta)));
        } else {
            copy_entry(entry.path(), &target, &meta)?;
        }
    }
    for (dir, mode) in dirs.iter().rev() {
        fs_util::set_mode(dir, *mode)?;
    }
    fs::remove_dir_all(from).io_context("remove", from)
}

fn copy_entry(from: &Path, to: &Path, meta: &fs::Metadata) -> Result<()> {
    #[cfg(unix)]
    if meta.file_type().is_symlink() {
        let link = fs::read_link(from).io_context("read link", from)?;
        return std::os::unix::fs::symlink(&link, to).io_context("symlink", to);
    }
    if meta.is_file() {
        fs::copy(from, to).io_context("copy", from)?;
    } else {
        tracing::debug!(path = %from.display(), "Skipping special file during copy");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(temp: &Path, tasks: &[&str]) -> (AllocDir, AllocDir) {
        let a = AllocDir::new(temp.join("a"));
        a.build(tasks).unwrap();
        let b = AllocDir::new(temp.join("b"));
        b.build(tasks).unwrap();
        (a, b)
    }

    #[test]
    fn test_move_merges_into_existing_directories() {
        let temp = tempfile::tempdir().unwrap();
        let (a, b) = pair(temp.path(), &["web"]);
        fs::create_dir_all(a.data_dir().join("db")).unwrap();
        fs::write(a.data_dir().join("db/new"), "from a").unwrap();
        fs::write(a.data_dir().join("shared"), "a").unwrap();
        fs::create_dir_all(b.data_dir().join("db")).unwrap();
        fs::write(b.data_dir().join("db/old"), "kept").unwrap();
        fs::write(b.data_dir().join("shared"), "b").unwrap();

        b.move_from(&a, &["web"]).unwrap();

        assert_eq!(fs::read_to_string(b.data_dir().join("db/new")).unwrap(), "from a");
        assert_eq!(fs::read_to_string(b.data_dir().join("db/old")).unwrap(), "kept");
        assert_eq!(fs::read_to_string(b.data_dir().join("shared")).unwrap(), "a");
        assert!(!a.data_dir().join("db").exists());
        // The source allocation is not deleted
        assert!(a.root().exists());
    }

    #[test]
    fn test_move_requires_task_on_both_sides() {
        let temp = tempfile::tempdir().unwrap();
        let a = AllocDir::new(temp.path().join("a"));
        a.build(&["web"]).unwrap();
        let b = AllocDir::new(temp.path().join("b"));
        b.build(&[]).unwrap();
        fs::write(a.data_dir().join("f"), "x").unwrap();

        let err = b.move_from(&a, &["web"]).unwrap_err();
        assert!(matches!(err, AllocDirError::TaskDirNotFound { ref task } if task == "web"));
        // Validation happens before anything is moved
        assert!(a.data_dir().join("f").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_then_remove_preserves_tree() {
        let temp = tempfile::tempdir().unwrap();
        let from = temp.path().join("from");
        fs::create_dir_all(from.join("sub")).unwrap();
        fs::write(from.join("sub/f"), "x").unwrap();
        std::os::unix::fs::symlink("sub/f", from.join("link")).unwrap();
        fs_util::set_mode(&from.join("sub"), 0o750).unwrap();
        let to = temp.path().join("to");

        let meta = fs::symlink_metadata(&from).unwrap();
        copy_then_remove(&from, &to, &meta).unwrap();

        assert!(!from.exists());
        assert_eq!(fs::read_to_string(to.join("sub/f")).unwrap(), "x");
        assert_eq!(fs::read_link(to.join("link")).unwrap(), PathBuf::from("sub/f"));
        assert_eq!(fs_util::mode_of(&fs::metadata(to.join("sub")).unwrap()), 0o750);
    }
}
