//! Path security validation for allocation directories.
//!
//! Every path accepted from a caller, or handed back to one, must resolve to
//! the allocation root or one of its descendants. Resolution here is purely
//! lexical: `.` and `..` segments are folded without touching the filesystem,
//! so the verdict does not depend on whether the target exists yet.
//!
//! A second, independent check classifies paths that fall inside a task's
//! secrets area. The read API composes both checks.
//!
//! ## Security
//! Lexical resolution cannot see symlinks. Read paths that exist on disk are
//! additionally confined physically with [`PathResolver::confine_existing`], so
//! a link planted by a task (`local/x -> /etc`) cannot widen what the read API
//! serves.

use std::io;
use std::path::{Component, Path, PathBuf};

use crate::config::{SHARED_ALLOC_NAME, TASK_SECRETS};
use crate::error::{AllocDirError, IoContext, Result};

/// Resolve `path` against `root` and reject anything outside it.
///
/// Relative paths are joined onto `root`. Absolute paths are taken as host
/// paths and must already lie under `root`.
pub fn resolve(root: &Path, path: &Path) -> Result<PathBuf> {
    let root = normalize_path_lexically(root);
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    };
    let resolved = normalize_path_lexically(&joined);

    if resolved.starts_with(&root) {
        Ok(resolved)
    } else {
        Err(AllocDirError::EscapesSandbox {
            path: path.to_string_lossy().into_owned(),
        })
    }
}

/// True if `resolved` (already under `root`) lies in some task's secrets area.
///
/// The check is structural (`<root>/<task>/secrets/...`) so it also covers task
/// directories left on disk by a previous agent run that are not registered.
pub fn is_secret_path(root: &Path, resolved: &Path) -> bool {
    let Ok(rel) = resolved.strip_prefix(root) else {
        return false;
    };
    let mut components = rel.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(task)), Some(Component::Normal(area))) => {
            task != SHARED_ALLOC_NAME && area == TASK_SECRETS
        }
        _ => false,
    }
}

/// Normalize a path lexically (without filesystem access).
///
/// `..` never climbs above the filesystem root.
pub fn normalize_path_lexically(path: &Path) -> PathBuf {
    let mut stack = Vec::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match stack.last() {
                Some(Component::Normal(_)) => {
                    stack.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => stack.push(component),
            },
            c => stack.push(c),
        }
    }

    stack.iter().collect()
}

/// Path resolution bound to one allocation root.
#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
}

impl PathResolver {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: normalize_path_lexically(root.as_ref()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Escape-checked resolution.
    pub fn resolve(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        resolve(&self.root, path.as_ref())
    }

    /// Escape check followed by the secrets check.
    pub fn resolve_readable(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = path.as_ref();
        let resolved = self.resolve(path)?;
        if self.is_secret(&resolved) {
            return Err(AllocDirError::SecretAccessProhibited {
                path: path.to_string_lossy().into_owned(),
            });
        }
        Ok(resolved)
    }

    pub fn is_secret(&self, resolved: &Path) -> bool {
        is_secret_path(&self.root, resolved)
    }

    /// Follow symlinks of an existing, already resolved path and re-check both
    /// the escape and the secrets rule against the physical location.
    ///
    /// `requested` is the caller's original path, used in error messages.
    pub fn confine_existing(&self, resolved: &Path, requested: &str) -> Result<PathBuf> {
        let (physical, physical_root) = self.confine_within(resolved, requested)?;
        if is_secret_path(&physical_root, &physical) {
            return Err(AllocDirError::SecretAccessProhibited {
                path: requested.to_string(),
            });
        }
        Ok(physical)
    }

    /// Physical escape check for a path that is about to be written.
    ///
    /// The deepest ancestor of `resolved` that exists (itself included, a
    /// dangling link counts) is canonicalised and must stay under the root.
    /// Levels below it do not exist yet, so creating them cannot follow a link.
    pub fn confine_nearest_existing(&self, resolved: &Path, requested: &str) -> Result<PathBuf> {
        let existing = resolved
            .ancestors()
            .find(|p| std::fs::symlink_metadata(p).is_ok())
            .unwrap_or(&self.root);
        self.confine_within(existing, requested).map(|(physical, _)| physical)
    }

    /// Canonical `(path, root)` pair, or `EscapesSandbox` if the path's
    /// physical location is outside the root.
    fn confine_within(&self, resolved: &Path, requested: &str) -> Result<(PathBuf, PathBuf)> {
        let physical = match std::fs::canonicalize(resolved) {
            Ok(p) => p,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(AllocDirError::NotFound {
                    path: requested.to_string(),
                });
            }
            Err(e) => return Err(AllocDirError::io("resolve", resolved, e)),
        };
        let physical_root = std::fs::canonicalize(&self.root).io_context("resolve", &self.root)?;

        if !physical.starts_with(&physical_root) {
            tracing::warn!(path = %requested, "Rejected path whose target leaves the allocation directory");
            return Err(AllocDirError::EscapesSandbox {
                path: requested.to_string(),
            });
        }
        Ok((physical, physical_root))
    }
}
