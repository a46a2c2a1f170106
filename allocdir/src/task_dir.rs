use std::path::{Component, Path, PathBuf};

use crate::config::{DirModes, SHARED_ALLOC_NAME, TASK_LOCAL, TASK_LOGS, TASK_SECRETS};
use crate::error::{AllocDirError, Result};
use crate::fs_util;

/// Per-task directory descriptor.
///
/// Creating a `TaskDir` does no I/O; the subtree only appears on disk when the
/// owning [`AllocDir`](crate::AllocDir) builds the task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDir {
    name: String,
    dir: PathBuf,
    local_dir: PathBuf,
    secrets_dir: PathBuf,
    log_dir: PathBuf,
    shared_alloc_dir: PathBuf,
}

impl TaskDir {
    pub(crate) fn new(alloc_root: &Path, name: &str) -> Self {
        let dir = alloc_root.join(name);
        Self {
            name: name.to_string(),
            local_dir: dir.join(TASK_LOCAL),
            secrets_dir: dir.join(TASK_SECRETS),
            log_dir: dir.join(TASK_LOGS),
            shared_alloc_dir: dir.join(SHARED_ALLOC_NAME),
            dir,
        }
    }

    /// Reject names that could not be a single directory under the root, or
    /// that would collide with the shared area.
    pub fn validate_name(name: &str) -> Result<()> {
        let invalid = |reason| AllocDirError::InvalidTaskName {
            name: name.to_string(),
            reason,
        };

        if name.is_empty() {
            return Err(invalid("name is empty"));
        }
        if name.contains('/') || name.contains('\\') {
            return Err(invalid("name contains a path separator"));
        }
        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => {}
            _ => return Err(invalid("name is not a plain directory name")),
        }
        if name == SHARED_ALLOC_NAME {
            return Err(invalid("name is reserved for the shared directory"));
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `<root>/<task>`
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writable scratch space.
    pub fn local_dir(&self) -> &Path {
        &self.local_dir
    }

    /// Sensitive material; never served by the read API nor archived.
    pub fn secrets_dir(&self) -> &Path {
        &self.secrets_dir
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Where the shared allocation directory is exposed inside the task.
    pub fn shared_alloc_dir(&self) -> &Path {
        &self.shared_alloc_dir
    }

    /// Create the task subtree. Re-running it only re-applies modes.
    pub(crate) fn build(&self, modes: &DirModes) -> Result<()> {
        fs_util::ensure_dir(&self.dir, modes.task)?;
        fs_util::ensure_dir(&self.local_dir, modes.task)?;
        fs_util::ensure_dir(&self.log_dir, modes.task)?;
        fs_util::ensure_dir(&self.secrets_dir, modes.secrets)?;
        tracing::debug!(task = %self.name, dir = %self.dir.display(), "Built task directory");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_follow_layout() {
        let td = TaskDir::new(Path::new("/allocs/a1"), "web");
        assert_eq!(td.dir(), Path::new("/allocs/a1/web"));
        assert_eq!(td.local_dir(), Path::new("/allocs/a1/web/local"));
        assert_eq!(td.secrets_dir(), Path::new("/allocs/a1/web/secrets"));
        assert_eq!(td.log_dir(), Path::new("/allocs/a1/web/logs"));
        assert_eq!(td.shared_alloc_dir(), Path::new("/allocs/a1/web/alloc"));
    }

    #[test]
    fn test_validate_name() {
        assert!(TaskDir::validate_name("web").is_ok());
        assert!(TaskDir::validate_name("web-2.redis_cache").is_ok());

        for bad in ["", ".", "..", "a/b", "../web", "/web", "alloc", "a\\b"] {
            assert!(
                matches!(
                    TaskDir::validate_name(bad),
                    Err(AllocDirError::InvalidTaskName { .. })
                ),
                "{bad:?} should be rejected"
            );
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_build_applies_modes() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().unwrap();
        let td = TaskDir::new(temp.path(), "web");
        td.build(&DirModes::default()).unwrap();

        let mode = |p: &Path| std::fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(td.secrets_dir()), crate::config::SECRETS_DIR_MODE);
        assert_eq!(mode(td.local_dir()), crate::config::TASK_DIR_MODE);
        assert!(td.log_dir().is_dir());
        assert!(!td.shared_alloc_dir().exists());
    }
}
