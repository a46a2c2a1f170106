//! Migration of persisted state between allocations on the same node

mod common;

use allocdir::{AllocDir, AllocDirError};
use common::built_alloc;
use std::fs;

#[test]
fn test_move_reproduces_shared_and_local_files() {
    let (temp, source) = built_alloc(&["web"]);
    fs::write(source.data_dir().join("shared"), "data").unwrap();
    let local = source.task_dir("web").unwrap().local_dir().to_path_buf();
    fs::create_dir_all(local.join("nested")).unwrap();
    fs::write(local.join("nested/task"), "local").unwrap();

    let dest = AllocDir::new(temp.path().join("dest"));
    dest.build(&["web"]).unwrap();
    dest.move_from(&source, &["web"]).unwrap();

    assert_eq!(fs::read_to_string(dest.data_dir().join("shared")).unwrap(), "data");
    let dest_local = dest.task_dir("web").unwrap().local_dir().to_path_buf();
    assert_eq!(
        fs::read_to_string(dest_local.join("nested/task")).unwrap(),
        "local"
    );

    // Content moved, source allocation still present until destroyed
    assert!(!source.data_dir().join("shared").exists());
    assert!(source.root().is_dir());
    source.destroy().unwrap();
    assert!(dest_local.join("nested/task").exists());
}

#[test]
fn test_move_leaves_unnamed_tasks_alone() {
    let (temp, source) = built_alloc(&["web", "db"]);
    let db_local = source.task_dir("db").unwrap().local_dir().to_path_buf();
    fs::write(db_local.join("keep"), "x").unwrap();

    let dest = AllocDir::new(temp.path().join("dest"));
    dest.build(&["web", "db"]).unwrap();
    dest.move_from(&source, &["web"]).unwrap();

    assert!(db_local.join("keep").exists());
    assert!(!dest.task_dir("db").unwrap().local_dir().join("keep").exists());
}

#[test]
fn test_move_into_unbuilt_destination_task_fails() {
    let (temp, source) = built_alloc(&["web"]);
    let dest = AllocDir::new(temp.path().join("dest"));
    dest.build(&[]).unwrap();
    dest.new_task_dir("web").unwrap();

    let err = dest.move_from(&source, &["web"]).unwrap_err();
    assert!(matches!(err, AllocDirError::TaskDirNotFound { .. }));
}

#[test]
fn test_move_from_destroyed_source_fails() {
    let (temp, source) = built_alloc(&["web"]);
    source.destroy().unwrap();
    let dest = AllocDir::new(temp.path().join("dest"));
    dest.build(&["web"]).unwrap();

    assert!(matches!(
        dest.move_from(&source, &["web"]),
        Err(AllocDirError::Destroyed)
    ));
}
