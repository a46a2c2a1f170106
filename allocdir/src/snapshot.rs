//! Tar snapshot and restore of the persisted regions.
//!
//! Only `alloc/data` and each built task's `local` directory are persisted.
//! Entry names are relative to the allocation root (`alloc/data/db.sqlite`,
//! `web/local/cache/index`), so a snapshot of one allocation restores into a
//! sibling that registered the same task names.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

use crate::alloc_dir::AllocDir;
use crate::config::{SHARED_ALLOC_NAME, SHARED_DATA_DIR, TASK_LOCAL};
use crate::error::{AllocDirError, IoContext, Result};
use crate::fs_util;

impl AllocDir {
    /// Write every regular file of the persisted regions to `writer` as a tar
    /// stream. Symlinks and special files are not archived.
    pub fn snapshot<W: Write>(&self, writer: W) -> Result<()> {
        self.ensure_live()?;

        let mut regions = vec![self.data_dir()];
        regions.extend(
            self.built_task_dirs()
                .iter()
                .map(|td| td.local_dir().to_path_buf()),
        );

        let mut builder = tar::Builder::new(writer);
        builder.follow_symlinks(false);

        let mut files = 0usize;
        for region in regions.iter().filter(|r| r.is_dir()) {
            for entry in WalkDir::new(region).follow_links(false).sort_by_file_name() {
                let entry = entry.map_err(|e| {
                    let path = e.path().unwrap_or(region).to_path_buf();
                    AllocDirError::io("walk", path, io::Error::other(e))
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let name = entry.path().strip_prefix(self.root()).map_err(|_| {
                    AllocDirError::EscapesSandbox {
                        path: entry.path().to_string_lossy().into_owned(),
                    }
                })?;
                let mut file = File::open(entry.path()).io_context("open", entry.path())?;
                builder
                    .append_file(name, &mut file)
                    .io_context("archive", entry.path())?;
                files += 1;
            }
        }

        let mut writer = builder.into_inner().io_context("archive", self.root())?;
        writer.flush().io_context("archive", self.root())?;
        tracing::info!(alloc_dir = %self.root().display(), files, "Wrote allocation snapshot");
        Ok(())
    }

    /// Unpack a stream produced by [`AllocDir::snapshot`] into this allocation.
    ///
    /// Every entry must target `alloc/data/...` or `<task>/local/...` of a
    /// built task; anything else aborts the restore. Directory entries are
    /// skipped since parents are created on demand. Existing files are
    /// overwritten.
    pub fn restore<R: Read>(&self, reader: R) -> Result<()> {
        self.ensure_live()?;

        let mut archive = tar::Archive::new(reader);
        archive.set_preserve_mtime(true);

        let mut files = 0usize;
        for entry in archive.entries().io_context("read archive", self.root())? {
            let mut entry = entry.io_context("read archive", self.root())?;
            let name = entry
                .path()
                .io_context("read archive", self.root())?
                .into_owned();
            let entry_type = entry.header().entry_type();
            if entry_type.is_dir() {
                continue;
            }
            if !entry_type.is_file() {
                return Err(invalid_entry(&name, "not a regular file"));
            }

            let target = self.restore_target(&name)?;
            self.prepare_restore_target(&target, &name)?;
            entry.unpack(&target).io_context("unpack", &target)?;
            files += 1;
        }

        tracing::info!(alloc_dir = %self.root().display(), files, "Restored allocation snapshot");
        Ok(())
    }

    /// Create the parents of `target` without following a symlink planted by a
    /// task, and drop a link sitting at `target` itself.
    fn prepare_restore_target(&self, target: &Path, name: &Path) -> Result<()> {
        let shown = name.to_string_lossy();
        if let Some(parent) = target.parent() {
            self.resolver().confine_nearest_existing(parent, &shown)?;
            fs_util::create_dir_all_no_follow(parent, self.config().dir_modes.task)?;
            self.resolver().confine_existing(parent, &shown)?;
        }
        if fs::symlink_metadata(target).is_ok_and(|meta| meta.file_type().is_symlink()) {
            fs::remove_file(target).io_context("remove symlink", target)?;
        }
        Ok(())
    }

    /// Map an archive entry name onto its destination inside this allocation.
    fn restore_target(&self, name: &Path) -> Result<PathBuf> {
        let mut parts = Vec::new();
        for component in name.components() {
            match component {
                Component::Normal(part) => parts.push(part),
                Component::CurDir => {}
                _ => return Err(invalid_entry(name, "path is not a plain relative path")),
            }
        }

        match parts.as_slice() {
            [alloc, data, _, ..] if *alloc == SHARED_ALLOC_NAME && *data == SHARED_DATA_DIR => {}
            [task, local, _, ..] if *local == TASK_LOCAL && *task != SHARED_ALLOC_NAME => {
                let task = task.to_string_lossy();
                self.built_task_dir(&task)?;
            }
            _ => return Err(invalid_entry(name, "outside the persisted regions")),
        }

        let rel: PathBuf = parts.iter().collect();
        self.resolver().resolve(rel)
    }
}

fn invalid_entry(name: &Path, reason: &'static str) -> AllocDirError {
    AllocDirError::InvalidArchiveEntry {
        name: name.to_string_lossy().into_owned(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn archive_with(name: &str, body: &[u8]) -> Vec<u8> {
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        // Written raw so names the builder would refuse (`..`) can be tested
        let raw = &mut header.as_old_mut().name;
        raw.fill(0);
        raw[..name.len()].copy_from_slice(name.as_bytes());
        header.set_cksum();

        let mut builder = tar::Builder::new(Vec::new());
        builder.append(&header, body).unwrap();
        builder.into_inner().unwrap()
    }

    fn built(root: &Path, tasks: &[&str]) -> AllocDir {
        let d = AllocDir::new(root);
        d.build(tasks).unwrap();
        d
    }

    #[test]
    fn test_restore_target_mapping() {
        let temp = tempfile::tempdir().unwrap();
        let d = built(&temp.path().join("a"), &["web"]);

        assert_eq!(
            d.restore_target(Path::new("alloc/data/x")).unwrap(),
            d.data_dir().join("x")
        );
        assert_eq!(
            d.restore_target(Path::new("./web/local/a/b")).unwrap(),
            d.root().join("web/local/a/b")
        );
        for name in ["alloc/logs/x", "web/secrets/x", "web/x", "alloc/data", "/etc/x"] {
            assert!(
                matches!(
                    d.restore_target(Path::new(name)),
                    Err(AllocDirError::InvalidArchiveEntry { .. })
                ),
                "{name} should be rejected"
            );
        }
        assert!(matches!(
            d.restore_target(Path::new("db/local/x")),
            Err(AllocDirError::TaskDirNotFound { .. })
        ));
    }

    #[test]
    fn test_restore_rejects_parent_segments() {
        let temp = tempfile::tempdir().unwrap();
        let d = built(&temp.path().join("a"), &["web"]);

        let tar = archive_with("web/local/../../../evil", b"x");
        let err = d.restore(tar.as_slice()).unwrap_err();
        assert!(matches!(err, AllocDirError::InvalidArchiveEntry { .. }));
        assert!(!temp.path().join("evil").exists());
    }

    #[test]
    fn test_restore_secrets_entry_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let d = built(&temp.path().join("a"), &["web"]);

        let tar = archive_with("web/secrets/token", b"stolen");
        assert!(d.restore(tar.as_slice()).is_err());
        assert!(!d.root().join("web/secrets/token").exists());
    }

    #[test]
    fn test_snapshot_skips_unpersisted_areas() {
        let temp = tempfile::tempdir().unwrap();
        let d = built(&temp.path().join("a"), &["web"]);
        let web = d.task_dir("web").unwrap();
        fs::write(web.secrets_dir().join("token"), "s").unwrap();
        fs::write(d.log_dir().join("out.log"), "l").unwrap();
        fs::write(web.local_dir().join("keep"), "k").unwrap();

        let mut buf = Vec::new();
        d.snapshot(&mut buf).unwrap();

        let mut archive = tar::Archive::new(buf.as_slice());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["web/local/keep".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn test_restore_does_not_create_dirs_through_planted_symlink() {
        let temp = tempfile::tempdir().unwrap();
        let d = built(&temp.path().join("a"), &["web"]);
        let outside = temp.path().join("outside");
        fs::create_dir_all(&outside).unwrap();
        let local = d.task_dir("web").unwrap().local_dir().to_path_buf();
        std::os::unix::fs::symlink(&outside, local.join("sub")).unwrap();

        let tar = archive_with("web/local/sub/deep/f", b"x");
        let err = d.restore(tar.as_slice()).unwrap_err();
        assert!(matches!(err, AllocDirError::EscapesSandbox { .. }));
        assert!(!outside.join("deep").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_restore_replaces_planted_file_symlink() {
        let temp = tempfile::tempdir().unwrap();
        let d = built(&temp.path().join("a"), &["web"]);
        let victim = temp.path().join("victim");
        fs::write(&victim, "untouched").unwrap();
        let local = d.task_dir("web").unwrap().local_dir().to_path_buf();
        std::os::unix::fs::symlink(&victim, local.join("f")).unwrap();

        let tar = archive_with("web/local/f", b"restored");
        d.restore(tar.as_slice()).unwrap();
        assert_eq!(fs::read_to_string(&victim).unwrap(), "untouched");
        assert_eq!(fs::read_to_string(local.join("f")).unwrap(), "restored");
        assert!(!fs::symlink_metadata(local.join("f")).unwrap().file_type().is_symlink());
    }
}
