//! Read-only file access for remote callers.
//!
//! `list`, `stat` and `read_at` are the only sanctioned way for an RPC layer to
//! touch files of an allocation. Each call resolves the caller path lexically
//! against the root, rejects the secrets area, then re-checks the physical
//! location of the existing target so symlinks cannot widen access.

use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::alloc_dir::AllocDir;
use crate::error::{AllocDirError, IoContext, Result};
use crate::fs_util;

/// Metadata of one file or directory, as returned to remote callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocFileInfo {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    /// `ls -l` style permission string
    pub file_mode: String,
    #[serde(with = "crate::utils::time")]
    pub mod_time: SystemTime,
}

impl AllocFileInfo {
    fn from_metadata(name: String, meta: &fs::Metadata) -> Self {
        Self {
            name,
            is_dir: meta.is_dir(),
            size: meta.len(),
            file_mode: fs_util::mode_string(meta.is_dir(), fs_util::mode_of(meta)),
            mod_time: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        }
    }
}

impl AllocDir {
    /// Entries of a directory inside the allocation, sorted by name.
    pub fn list(&self, path: impl AsRef<Path>) -> Result<Vec<AllocFileInfo>> {
        let (_, physical) = self.resolve_for_read(path.as_ref())?;

        let mut entries = Vec::new();
        for entry in fs::read_dir(&physical).io_context("list", &physical)? {
            let entry = entry.io_context("list", &physical)?;
            let meta = fs::symlink_metadata(entry.path()).io_context("stat", entry.path())?;
            entries.push(AllocFileInfo::from_metadata(
                entry.file_name().to_string_lossy().into_owned(),
                &meta,
            ));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Metadata of one path inside the allocation.
    pub fn stat(&self, path: impl AsRef<Path>) -> Result<AllocFileInfo> {
        let (lexical, physical) = self.resolve_for_read(path.as_ref())?;
        let meta = fs::metadata(&physical).io_context("stat", &physical)?;
        let name = lexical
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "/".to_string());
        Ok(AllocFileInfo::from_metadata(name, &meta))
    }

    /// Open a regular file positioned at `offset`.
    pub fn read_at(&self, path: impl AsRef<Path>, offset: u64) -> Result<File> {
        let requested = path.as_ref();
        let (_, physical) = self.resolve_for_read(requested)?;

        let mut file = File::open(&physical).io_context("open", &physical)?;
        let meta = file.metadata().io_context("stat", &physical)?;
        if meta.is_dir() {
            return Err(AllocDirError::io(
                "read",
                &physical,
                std::io::Error::new(std::io::ErrorKind::IsADirectory, "is a directory"),
            ));
        }
        file.seek(SeekFrom::Start(offset))
            .io_context("seek", &physical)?;
        Ok(file)
    }

    /// Read at most `limit` bytes starting at `offset`.
    pub fn read_at_most(&self, path: impl AsRef<Path>, offset: u64, limit: u64) -> Result<Vec<u8>> {
        let requested = path.as_ref();
        let file = self.read_at(requested, offset)?;
        let mut buf = Vec::new();
        file.take(limit)
            .read_to_end(&mut buf)
            .io_context("read", requested)?;
        Ok(buf)
    }

    fn resolve_for_read(&self, requested: &Path) -> Result<(PathBuf, PathBuf)> {
        let shown = requested.to_string_lossy();
        let lexical = self.resolver().resolve_readable(requested).inspect_err(|e| {
            tracing::debug!(path = %shown, error = %e, "Rejected read request");
        })?;
        let physical = self.resolver().confine_existing(&lexical, &shown)?;
        Ok((lexical, physical))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn built() -> (tempfile::TempDir, AllocDir) {
        let temp = tempfile::tempdir().unwrap();
        let d = AllocDir::new(temp.path().join("alloc-1"));
        d.build(&["web"]).unwrap();
        (temp, d)
    }

    #[test]
    fn test_list_root() {
        let (_t, d) = built();
        // Absolute paths are host paths; "/" is outside the root
        assert!(matches!(
            d.list("/"),
            Err(AllocDirError::EscapesSandbox { .. })
        ));

        let names: Vec<String> = d.list("").unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["alloc".to_string(), "web".to_string()]);
    }

    #[test]
    fn test_stat_and_read_at() {
        let (_t, d) = built();
        std::fs::write(d.data_dir().join("f.txt"), "hello world").unwrap();

        let info = d.stat("alloc/data/f.txt").unwrap();
        assert_eq!(info.name, "f.txt");
        assert_eq!(info.size, 11);
        assert!(!info.is_dir);
        assert!(info.file_mode.starts_with('-'));

        let mut out = String::new();
        d.read_at("alloc/data/f.txt", 6)
            .unwrap()
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out, "world");

        assert_eq!(d.read_at_most("alloc/data/f.txt", 0, 5).unwrap(), b"hello");
    }

    #[test]
    fn test_missing_is_not_found() {
        let (_t, d) = built();
        let err = d.stat("web/local/nope").unwrap_err();
        assert!(err.is_not_found());
        assert!(!err.to_string().contains(&*d.root().to_string_lossy()));
    }

    #[test]
    fn test_read_at_directory_fails() {
        let (_t, d) = built();
        assert!(d.read_at("web/local", 0).is_err());
    }

    #[test]
    fn test_secret_blocked_for_every_accessor() {
        let (_t, d) = built();
        let secret = d.task_dir("web").unwrap().secrets_dir().join("token");
        std::fs::write(&secret, "s3cr3t").unwrap();

        for err in [
            d.read_at("web/secrets/token", 0).map(|_| ()).unwrap_err(),
            d.stat("web/secrets/token").map(|_| ()).unwrap_err(),
            d.list("web/secrets").map(|_| ()).unwrap_err(),
        ] {
            assert!(matches!(err, AllocDirError::SecretAccessProhibited { .. }));
        }
    }

    #[test]
    fn test_file_info_serializes_for_rpc() {
        let (_t, d) = built();
        let info = d.stat("web").unwrap();
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["name"], "web");
        assert_eq!(json["is_dir"], true);
        assert!(json["mod_time"].as_str().unwrap().ends_with('Z'));
    }
}
