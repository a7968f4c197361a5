// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `-s` signaller specs (failure paths; the happy paths live in the
//! lifecycle suite via raw signals).

use assert_cmd::Command;

const MINIMAL_CONF: &str = "daemon = false\n";

fn project() -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("quay.toml"), MINIMAL_CONF).expect("write conf");
    dir
}

fn stderr_of(assert: &assert_cmd::assert::Assert) -> String {
    String::from_utf8_lossy(&assert.get_output().stderr).to_string()
}

#[test]
fn unknown_signal_names_are_rejected() {
    let dir = project();
    let assert = Command::cargo_bin("quay")
        .expect("quay binary")
        .arg("-p")
        .arg(dir.path())
        .args(["-s", "restart"])
        .assert()
        .code(1);
    assert!(stderr_of(&assert).contains("unknown signal name"));
}

#[test]
fn signalling_without_a_running_master_fails() {
    let dir = project();
    let assert = Command::cargo_bin("quay")
        .expect("quay binary")
        .arg("-p")
        .arg(dir.path())
        .args(["-s", "stop"])
        .assert()
        .code(1);
    assert!(stderr_of(&assert).contains("pid file"), "got: {}", stderr_of(&assert));
}

#[test]
fn signaller_needs_a_readable_config() {
    let dir = tempfile::tempdir().expect("tempdir");
    Command::cargo_bin("quay")
        .expect("quay binary")
        .arg("-p")
        .arg(dir.path())
        .args(["-s", "stop"])
        .assert()
        .code(1);
}
