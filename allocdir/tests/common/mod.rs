#![allow(dead_code)]
use allocdir::AllocDir;
use std::path::Path;
use tempfile::TempDir;

pub fn init_test_logging() {
    allocdir::utils::logging::init_test_logging();
}

/// A fresh allocation under its own temp dir, built for `tasks`.
pub fn built_alloc(tasks: &[&str]) -> (TempDir, AllocDir) {
    init_test_logging();
    let temp = tempfile::tempdir().unwrap();
    let alloc = AllocDir::new(temp.path().join("alloc-root"));
    alloc.build(tasks).unwrap();
    (temp, alloc)
}

/// Names of the direct children of `dir`, sorted.
pub fn child_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[cfg(unix)]
pub fn mode(path: &Path) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).unwrap().permissions().mode() & 0o7777
}
