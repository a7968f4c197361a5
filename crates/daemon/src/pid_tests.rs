// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn create_writes_our_pid_with_a_trailing_newline() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run/quay.pid");

    let pid_file = create(&path).unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    assert_eq!(text, format!("{}\n", std::process::id()));
    assert_eq!(read(&path).unwrap(), std::process::id() as i32);

    pid_file.delete();
    assert!(!path.exists());
}

#[test]
fn second_create_is_rejected_while_locked() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("quay.pid");

    let _held = create(&path).unwrap();
    let err = create(&path).unwrap_err();
    assert!(matches!(err, PidError::AlreadyRunning(_)), "got: {err}");

    // The loser must not have truncated the winner's pid.
    assert_eq!(read(&path).unwrap(), std::process::id() as i32);
}

#[test]
fn malformed_content_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("quay.pid");

    std::fs::write(&path, "not-a-pid\n").unwrap();
    assert!(matches!(read(&path), Err(PidError::Malformed(_))));

    std::fs::write(&path, "-5\n").unwrap();
    assert!(matches!(read(&path), Err(PidError::Malformed(_))));
}

#[test]
fn rename_moves_the_file_and_tracks_the_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("quay.pid");
    let oldbin = dir.path().join("quay.pid.oldbin");

    let mut pid_file = create(&path).unwrap();
    pid_file.rename(&oldbin).unwrap();
    assert!(!path.exists());
    assert!(oldbin.exists());
    assert_eq!(pid_file.path(), oldbin.as_path());

    // Rollback: rename back to the primary path.
    pid_file.rename(&path).unwrap();
    assert!(path.exists());

    pid_file.delete();
    assert!(!path.exists());
}
