// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::cycle::{BootInfo, Cycle, InitOptions};
use crate::logfile::ErrorLog;

fn cycle_with_two_listeners() -> (tempfile::TempDir, Cycle) {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("quay.toml"),
        "[[listen]]\naddr = \"127.0.0.1:0\"\n\n[[listen]]\naddr = \"127.0.0.2:0\"\n",
    )
    .unwrap();
    let cycle = Cycle::init(
        None,
        ErrorLog::stderr(),
        InitOptions {
            boot: BootInfo {
                prefix: dir.path().to_path_buf(),
                conf_file: dir.path().join("quay.toml"),
                directives: None,
                error_log: None,
            },
            inherited: Vec::new(),
            open_sockets: true,
        },
    )
    .unwrap();
    (dir, cycle)
}

#[test]
fn listener_value_lists_every_open_descriptor() {
    let (_dir, cycle) = cycle_with_two_listeners();
    let a = cycle.listeners[0].raw_fd().unwrap();
    let b = cycle.listeners[1].raw_fd().unwrap();
    assert_eq!(listener_fds_value(&cycle), format!("{a};{b};"));
}

#[test]
fn ignored_and_closed_listeners_are_skipped() {
    let (_dir, mut cycle) = cycle_with_two_listeners();
    let b = cycle.listeners[1].raw_fd().unwrap();

    cycle.listeners[0].ignore = true;
    assert_eq!(listener_fds_value(&cycle), format!("{b};"));

    cycle.listeners[1].close();
    assert_eq!(listener_fds_value(&cycle), "");
}

#[test]
fn emitted_value_parses_back() {
    let (_dir, cycle) = cycle_with_two_listeners();
    let value = listener_fds_value(&cycle);
    let fds = crate::listener::parse_inherited(&value).unwrap();
    assert_eq!(fds.len(), 2);
}
