// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! CLI surface specs: versions, help, and flag errors.

use assert_cmd::Command;

fn quay() -> Command {
    Command::cargo_bin("quay").expect("quay binary")
}

fn stderr_of(assert: &assert_cmd::assert::Assert) -> String {
    String::from_utf8_lossy(&assert.get_output().stderr).to_string()
}

fn stdout_of(assert: &assert_cmd::assert::Assert) -> String {
    String::from_utf8_lossy(&assert.get_output().stdout).to_string()
}

#[test]
fn version_flag_prints_the_version() {
    let assert = quay().arg("-v").assert().code(0);
    assert!(stderr_of(&assert).contains("quay version quay/"));
}

#[test]
fn capital_v_adds_build_information() {
    let assert = quay().arg("-V").assert().code(0);
    let stderr = stderr_of(&assert);
    assert!(stderr.contains("quay version quay/"));
    assert!(stderr.contains("build: "));
}

#[test]
fn help_lists_the_flag_surface() {
    let assert = quay().arg("-h").assert().code(0);
    let help = stdout_of(&assert);
    for flag in ["-s", "-p", "-e", "-c", "-g", "-t", "-T", "-q"] {
        assert!(help.contains(flag), "help is missing {flag}:\n{help}");
    }
}

#[test]
fn question_mark_is_a_help_alias() {
    let assert = quay().arg("-?").assert().code(0);
    assert!(stdout_of(&assert).contains("Usage"));
}

#[test]
fn unknown_flags_exit_nonzero() {
    quay().arg("-z").assert().code(1);
}
