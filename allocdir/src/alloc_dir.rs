use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use allocdir_common::StateMachine;
use tokio_util::sync::CancellationToken;

use crate::config::{
    AllocDirConfig, SHARED_ALLOC_NAME, SHARED_DATA_DIR, SHARED_LOG_DIR, SHARED_TMP_DIR,
};
use crate::error::{AllocDirError, Result};
use crate::fs_util;
use crate::mount::{Mounter, platform_mounter};
use crate::path_security::{PathResolver, normalize_path_lexically};
use crate::task_dir::TaskDir;

#[derive(Debug, Default)]
struct AllocState {
    task_dirs: HashMap<String, TaskDir>,
    built: HashSet<String>,
    mounted: HashSet<String>,
    destroyed: bool,
}

/// The directory tree of one allocation.
///
/// Task names are registered in memory first and only materialized on disk by
/// [`AllocDir::build`]. [`AllocDir::destroy`] is terminal and idempotent.
pub struct AllocDir {
    root: PathBuf,
    shared_dir: PathBuf,
    resolver: PathResolver,
    config: AllocDirConfig,
    mounter: Arc<dyn Mounter>,
    state: StateMachine<AllocState>,
    teardown: CancellationToken,
}

impl std::fmt::Debug for AllocDir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.state.read(|state| {
            f.debug_struct("AllocDir")
                .field("root", &self.root)
                .field("mounter", &self.mounter.name())
                .field("tasks", &state.task_dirs.keys().collect::<Vec<_>>())
                .field("built", &state.built)
                .field("destroyed", &state.destroyed)
                .finish()
        })
    }
}

impl AllocDir {
    /// Describe an allocation rooted at `root`. No I/O happens until `build`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self::with_config(root, AllocDirConfig::default())
    }

    pub fn with_config(root: impl AsRef<Path>, config: AllocDirConfig) -> Self {
        let root = root.as_ref();
        let root = normalize_path_lexically(
            &std::path::absolute(root).unwrap_or_else(|_| root.to_path_buf()),
        );
        Self {
            shared_dir: root.join(SHARED_ALLOC_NAME),
            resolver: PathResolver::new(&root),
            root,
            config,
            mounter: platform_mounter(),
            state: StateMachine::new(AllocState::default()),
            teardown: CancellationToken::new(),
        }
    }

    /// Replace the platform mounter.
    pub fn with_mounter(mut self, mounter: Arc<dyn Mounter>) -> Self {
        self.mounter = mounter;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/alloc`, visible to every task.
    pub fn shared_dir(&self) -> &Path {
        &self.shared_dir
    }

    /// Persisted shared data, the region Snapshot and Move carry over.
    pub fn data_dir(&self) -> PathBuf {
        self.shared_dir.join(SHARED_DATA_DIR)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.shared_dir.join(SHARED_LOG_DIR)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.shared_dir.join(SHARED_TMP_DIR)
    }

    pub fn config(&self) -> &AllocDirConfig {
        &self.config
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    pub fn mounter(&self) -> &Arc<dyn Mounter> {
        &self.mounter
    }

    /// Register a task. Registering the same name again returns the existing
    /// descriptor.
    pub fn new_task_dir(&self, name: &str) -> Result<TaskDir> {
        TaskDir::validate_name(name)?;
        self.state.transition(|state| {
            if state.destroyed {
                return Err(AllocDirError::Destroyed);
            }
            Ok(state
                .task_dirs
                .entry(name.to_string())
                .or_insert_with(|| TaskDir::new(&self.root, name))
                .clone())
        })
    }

    pub fn task_dir(&self, name: &str) -> Option<TaskDir> {
        self.state.read(|state| state.task_dirs.get(name).cloned())
    }

    /// Registered task names, sorted.
    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.state.read(|state| state.task_dirs.keys().cloned().collect());
        names.sort();
        names
    }

    pub fn is_built(&self, task: &str) -> bool {
        self.state.read(|state| state.built.contains(task))
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.read(|state| state.destroyed)
    }

    /// Materialize the root and shared area, plus the subtree of every named
    /// task (registering names not seen before). Tasks built by an earlier
    /// call are left untouched.
    ///
    /// Not transactional: on failure whatever was created stays on disk until
    /// [`AllocDir::destroy`].
    pub fn build(&self, tasks: &[&str]) -> Result<()> {
        for name in tasks {
            TaskDir::validate_name(name)?;
        }
        let pending: Vec<TaskDir> = self.state.transition(|state| {
            if state.destroyed {
                return Err(AllocDirError::Destroyed);
            }
            let mut pending = Vec::new();
            for name in tasks {
                let task_dir = state
                    .task_dirs
                    .entry((*name).to_string())
                    .or_insert_with(|| TaskDir::new(&self.root, name))
                    .clone();
                if !state.built.contains(*name) && !pending.contains(&task_dir) {
                    pending.push(task_dir);
                }
            }
            Ok(pending)
        })?;

        let modes = &self.config.dir_modes;
        fs_util::ensure_dir(&self.root, modes.root)?;
        fs_util::ensure_dir(&self.shared_dir, modes.shared)?;
        for area in [self.data_dir(), self.log_dir(), self.tmp_dir()] {
            fs_util::ensure_dir(&area, modes.shared)?;
        }

        for task_dir in &pending {
            task_dir.build(modes)?;
            self.state.transition(|state| {
                state.built.insert(task_dir.name().to_string());
            });
        }

        tracing::info!(
            alloc_dir = %self.root.display(),
            tasks = ?pending.iter().map(TaskDir::name).collect::<Vec<_>>(),
            "Built allocation directory"
        );
        Ok(())
    }

    /// Expose the shared directory at `<task>/alloc`. Mounting an already
    /// exposed task is a no-op.
    pub fn mount_shared_dir(&self, task: &str) -> Result<()> {
        let task_dir = self.state.transition(|state| {
            if state.destroyed {
                return Err(AllocDirError::Destroyed);
            }
            if state.mounted.contains(task) {
                return Ok(None);
            }
            built_task(state, task).map(Some)
        })?;
        let Some(task_dir) = task_dir else {
            return Ok(());
        };

        self.mounter
            .mount(&self.shared_dir, task_dir.shared_alloc_dir())?;
        self.state.transition(|state| {
            state.mounted.insert(task.to_string());
        });
        tracing::info!(task, mounter = self.mounter.name(), "Exposed shared directory");
        Ok(())
    }

    /// Sever one task's view of the shared directory.
    ///
    /// The exposure stays tracked until the unmount succeeds, so a failure
    /// here is retried by `destroy`.
    pub fn unmount_shared_dir(&self, task: &str) -> Result<()> {
        let task_dir = self.state.read(|state| {
            state
                .task_dirs
                .get(task)
                .cloned()
                .ok_or_else(|| AllocDirError::TaskDirNotFound {
                    task: task.to_string(),
                })
        })?;
        self.mounter.unmount(task_dir.shared_alloc_dir())?;
        self.state.transition(|state| {
            state.mounted.remove(task);
        });
        Ok(())
    }

    /// Unmount every exposure and remove the whole tree.
    ///
    /// Best effort: every unmount and the removal are attempted even if some
    /// fail, and only the last error is returned. Safe on a never-built
    /// allocation; later calls are no-ops. Pending watchers are woken.
    pub fn destroy(&self) -> Result<()> {
        let Some((mounted, others)) = self.state.transition(|state| {
            if state.destroyed {
                return None;
            }
            state.destroyed = true;
            let (mounted, others): (Vec<TaskDir>, Vec<TaskDir>) = state
                .task_dirs
                .values()
                .cloned()
                .partition(|td| state.mounted.contains(td.name()));
            state.mounted.clear();
            Some((mounted, others))
        }) else {
            return Ok(());
        };

        self.teardown.cancel();

        let mut last_err = None;
        for task_dir in &mounted {
            if let Err(e) = self.mounter.unmount(task_dir.shared_alloc_dir()) {
                tracing::warn!(task = %task_dir.name(), error = %e, "Failed to unmount shared directory");
                last_err = Some(e);
            }
        }
        // Exposures made by an earlier agent process are not tracked
        for task_dir in &others {
            if std::fs::symlink_metadata(task_dir.shared_alloc_dir()).is_ok()
                && let Err(e) = self.mounter.unmount(task_dir.shared_alloc_dir())
            {
                tracing::debug!(task = %task_dir.name(), error = %e, "Untracked exposure not unmounted");
            }
        }

        if let Err(e) = remove_tree(&self.root) {
            tracing::warn!(alloc_dir = %self.root.display(), error = %e, "Failed to remove allocation directory");
            last_err = Some(e);
        }

        tracing::info!(alloc_dir = %self.root.display(), "Destroyed allocation directory");
        last_err.map_or(Ok(()), Err)
    }

    /// Fired by `destroy`; watchers select on it.
    pub(crate) fn teardown_token(&self) -> CancellationToken {
        self.teardown.clone()
    }

    /// A registered task whose subtree exists.
    pub(crate) fn built_task_dir(&self, task: &str) -> Result<TaskDir> {
        self.state.read(|state| built_task(state, task))
    }

    /// Every built task, sorted by name.
    pub(crate) fn built_task_dirs(&self) -> Vec<TaskDir> {
        let mut tasks: Vec<TaskDir> = self.state.read(|state| {
            state
                .built
                .iter()
                .filter_map(|name| state.task_dirs.get(name).cloned())
                .collect()
        });
        tasks.sort_by(|a, b| a.name().cmp(b.name()));
        tasks
    }

    pub(crate) fn ensure_live(&self) -> Result<()> {
        if self.is_destroyed() {
            Err(AllocDirError::Destroyed)
        } else {
            Ok(())
        }
    }
}

fn built_task(state: &AllocState, task: &str) -> Result<TaskDir> {
    match state.task_dirs.get(task) {
        Some(task_dir) if state.built.contains(task) => Ok(task_dir.clone()),
        _ => Err(AllocDirError::TaskDirNotFound {
            task: task.to_string(),
        }),
    }
}

/// `remove_dir_all`, retried once after granting the owner write access to
/// every directory (embedded host trees may be read-only).
fn remove_tree(root: &Path) -> Result<()> {
    match std::fs::remove_dir_all(root) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            tracing::debug!(alloc_dir = %root.display(), "Retrying removal after relaxing directory modes");
            for entry in walkdir::WalkDir::new(root)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_dir())
            {
                if let Ok(meta) = entry.metadata() {
                    let _ = fs_util::set_mode(entry.path(), fs_util::mode_of(&meta) | 0o700);
                }
            }
            std::fs::remove_dir_all(root)
                .or_else(|e| match e.kind() {
                    io::ErrorKind::NotFound => Ok(()),
                    _ => Err(e),
                })
                .map_err(|e| AllocDirError::io("remove", root, e))
        }
        Err(e) => Err(AllocDirError::io("remove", root, e)),
    }
}
