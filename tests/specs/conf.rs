// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Config test mode (`-t`/`-T`) specs.

use assert_cmd::Command;

use crate::prelude::*;

const VALID_CONF: &str = r#"
daemon = false
worker_processes = 2

[[listen]]
addr = "127.0.0.1:0"
"#;

fn quay_in(dir: &tempfile::TempDir) -> Command {
    let mut cmd = Command::cargo_bin("quay").expect("quay binary");
    cmd.arg("-p").arg(dir.path());
    cmd
}

fn project(conf: &str) -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("quay.toml"), conf).expect("write conf");
    dir
}

fn stderr_of(assert: &assert_cmd::assert::Assert) -> String {
    String::from_utf8_lossy(&assert.get_output().stderr).to_string()
}

#[test]
fn test_mode_accepts_a_valid_config() {
    let dir = project(VALID_CONF);
    let assert = quay_in(&dir).arg("-t").assert().code(0);
    assert!(stderr_of(&assert).contains("test is successful"));
}

#[test]
fn quiet_mode_suppresses_the_success_line() {
    let dir = project(VALID_CONF);
    let assert = quay_in(&dir).args(["-t", "-q"]).assert().code(0);
    assert!(!stderr_of(&assert).contains("test is successful"));
}

#[test]
fn test_mode_rejects_a_broken_config() {
    let dir = project("worker_processes = = 2");
    let assert = quay_in(&dir).arg("-t").assert().code(1);
    assert!(stderr_of(&assert).contains("test failed"));
}

#[test]
fn test_mode_rejects_unknown_directives() {
    let dir = project("worker_procesess = 2");
    quay_in(&dir).arg("-t").assert().code(1);
}

#[test]
fn test_mode_rejects_a_missing_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let assert = quay_in(&dir).arg("-t").assert().code(1);
    assert!(stderr_of(&assert).contains("test failed"));
}

#[test]
fn dump_mode_prints_the_configuration() {
    let dir = project(VALID_CONF);
    let assert = quay_in(&dir).arg("-T").assert().code(0);
    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    assert!(stdout.contains("# configuration file"));
    assert!(stdout.contains("worker_processes = 2"));
}

#[test]
fn directives_override_the_file_in_test_mode() {
    // The override must be what fails, proving -g lands on top.
    let dir = project(VALID_CONF);
    quay_in(&dir).args(["-t", "-g", "worker_processes = \"many\""]).assert().code(1);
    quay_in(&dir).args(["-t", "-g", "worker_processes = \"auto\""]).assert().code(0);
}

#[test]
fn invalid_directive_text_is_rejected() {
    let dir = project(VALID_CONF);
    let assert = quay_in(&dir).args(["-t", "-g", "daemon ="]).assert().code(1);
    assert!(stderr_of(&assert).contains("-g"), "got: {}", stderr_of(&assert));
}

#[test]
fn test_mode_does_not_bind_the_listener() {
    // Hold the port; -t must still pass since it validates without
    // binding.
    let port = free_port();
    let listener = std::net::TcpListener::bind(("127.0.0.1", port)).expect("hold port");
    let dir = project(&format!(
        "daemon = false\n\n[[listen]]\naddr = \"127.0.0.1:{port}\"\n"
    ));
    quay_in(&dir).arg("-t").assert().code(0);
    drop(listener);
}
