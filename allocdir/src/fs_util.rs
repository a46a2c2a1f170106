//! Directory creation with explicit permission bits.
//!
//! `create_dir_all` honours the process umask, so every directory this crate
//! creates is chmod-ed afterwards to the mode it was asked for.

use std::fs;
use std::io;
use std::path::Path;

use crate::error::{AllocDirError, IoContext, Result};

/// Create `path` (and missing parents) and apply `mode` to `path` itself.
pub(crate) fn ensure_dir(path: &Path, mode: u32) -> Result<()> {
    fs::create_dir_all(path).io_context("create directory", path)?;
    set_mode(path, mode)
}

/// Create exactly one directory level with `mode`. An existing directory is
/// left untouched and reported as `Ok(false)`; an existing symlink, even one
/// pointing at a directory, is an error.
pub(crate) fn create_dir_with_mode(path: &Path, mode: u32) -> Result<bool> {
    match fs::create_dir(path) {
        Ok(()) => {
            set_mode(path, mode)?;
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => match fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => Ok(false),
            _ => Err(AllocDirError::io("create directory", path, e)),
        },
        Err(e) => Err(AllocDirError::io("create directory", path, e)),
    }
}

/// Create the missing levels of `path` one at a time with `mode`.
///
/// Unlike `create_dir_all`, the deepest existing level must be a real
/// directory, not a symlink to one. Callers confine that level first.
pub(crate) fn create_dir_all_no_follow(path: &Path, mode: u32) -> Result<()> {
    let mut missing = Vec::new();
    for level in path.ancestors().filter(|p| !p.as_os_str().is_empty()) {
        match fs::symlink_metadata(level) {
            Ok(meta) if meta.is_dir() => break,
            Ok(_) => {
                return Err(AllocDirError::io(
                    "create directory",
                    level,
                    io::Error::new(io::ErrorKind::AlreadyExists, "not a directory"),
                ));
            }
            Err(_) => missing.push(level),
        }
    }
    for dir in missing.into_iter().rev() {
        create_dir_with_mode(dir, mode)?;
    }
    Ok(())
}

#[cfg(unix)]
pub(crate) fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).io_context("set permissions", path)
}

#[cfg(not(unix))]
pub(crate) fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Permission bits (including setuid/setgid/sticky) of `meta`.
#[cfg(unix)]
pub(crate) fn mode_of(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
pub(crate) fn mode_of(meta: &fs::Metadata) -> u32 {
    if meta.permissions().readonly() {
        0o555
    } else {
        0o777
    }
}

/// Render permission bits the way `ls -l` does, e.g. `drwxr-x---`.
pub(crate) fn mode_string(is_dir: bool, mode: u32) -> String {
    let mut out = String::with_capacity(10);
    out.push(if is_dir { 'd' } else { '-' });
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_string() {
        assert_eq!(mode_string(true, 0o750), "drwxr-x---");
        assert_eq!(mode_string(false, 0o644), "-rw-r--r--");
        assert_eq!(mode_string(false, 0o4711), "-rwx--x--x");
    }

    #[cfg(unix)]
    #[test]
    fn test_ensure_dir_ignores_umask() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("a/b");
        ensure_dir(&dir, 0o777).unwrap();
        assert_eq!(mode_of(&fs::metadata(&dir).unwrap()), 0o777);
    }

    #[cfg(unix)]
    #[test]
    fn test_create_dir_with_mode_leaves_existing_alone() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("x");
        assert!(create_dir_with_mode(&dir, 0o710).unwrap());
        assert!(!create_dir_with_mode(&dir, 0o777).unwrap());
        assert_eq!(mode_of(&fs::metadata(&dir).unwrap()), 0o710);
    }

    #[cfg(unix)]
    #[test]
    fn test_existing_symlink_is_not_a_directory_level() {
        let temp = tempfile::tempdir().unwrap();
        let real = temp.path().join("real");
        fs::create_dir(&real).unwrap();
        let link = temp.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        assert!(create_dir_with_mode(&link, 0o755).is_err());
        assert!(create_dir_all_no_follow(&link.join("a/b"), 0o755).is_err());
        assert!(!real.join("a").exists());

        create_dir_all_no_follow(&temp.path().join("c/d"), 0o750).unwrap();
        assert_eq!(mode_of(&fs::metadata(temp.path().join("c/d")).unwrap()), 0o750);
    }
}
