// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::Path;

use yare::parameterized;

use super::*;
use crate::load_str;

fn parse(text: &str) -> Config {
    load_str(text, Path::new("test.toml"), None).unwrap()
}

#[test]
fn empty_config_gets_defaults() {
    let config = parse("");
    assert!(config.daemon);
    assert!(config.master);
    assert_eq!(config.worker_processes, WorkerCount::Count(1));
    assert_eq!(config.pid, Path::new("quay.pid"));
    assert_eq!(config.priority, 0);
    assert!(config.listeners.is_empty());
    assert!(config.debug_points.is_none());
}

#[parameterized(
    fixed = { "worker_processes = 4", WorkerCount::Count(4) },
    auto = { "worker_processes = \"auto\"", WorkerCount::Auto },
)]
fn worker_processes_forms(text: &str, expected: WorkerCount) {
    assert_eq!(parse(text).worker_processes, expected);
}

#[test]
fn worker_count_auto_resolves_to_ncpu() {
    let config = parse("worker_processes = \"auto\"");
    assert_eq!(config.worker_count(6), 6);
    // Fixed counts ignore ncpu.
    assert_eq!(parse("worker_processes = 2").worker_count(6), 2);
}

#[test]
fn worker_processes_rejects_other_strings() {
    assert!(load_str("worker_processes = \"many\"", Path::new("t"), None).is_err());
}

#[test]
fn listen_blocks_parse() {
    let config = parse(
        r#"
[[listen]]
addr = "127.0.0.1:8080"

[[listen]]
addr = "0.0.0.0:8443"
backlog = 128
reuseport = true
"#,
    );
    assert_eq!(config.listeners.len(), 2);
    assert_eq!(config.listeners[0].backlog, 511);
    assert!(!config.listeners[0].reuseport);
    assert_eq!(config.listeners[1].backlog, 128);
    assert!(config.listeners[1].reuseport);
}

#[test]
fn cache_path_defaults() {
    let config = parse(
        r#"
[[cache_path]]
path = "cache"
manager = true
loader = true
"#,
    );
    let cache = &config.cache_paths[0];
    assert!(cache.manager);
    assert!(cache.loader);
    assert_eq!(cache.inactive, 600_000);
    assert_eq!(cache.interval, 10_000);
}

#[test]
fn debug_points_values() {
    assert_eq!(parse("debug_points = \"stop\"").debug_points, Some(DebugPoints::Stop));
    assert_eq!(parse("debug_points = \"abort\"").debug_points, Some(DebugPoints::Abort));
    assert!(load_str("debug_points = \"explode\"", Path::new("t"), None).is_err());
}

#[test]
fn resolve_paths_rebases_relative_paths_only() {
    let mut config = parse(
        r#"
pid = "run/quay.pid"
error_log = "/var/log/quay/error.log"
access_log = "logs/access.log"

[[cache_path]]
path = "cache"
"#,
    );
    config.resolve_paths(Path::new("/srv/quay"));

    assert_eq!(config.pid, Path::new("/srv/quay/run/quay.pid"));
    assert_eq!(config.error_log.as_deref(), Some(Path::new("/var/log/quay/error.log")));
    assert_eq!(config.access_log.as_deref(), Some(Path::new("/srv/quay/logs/access.log")));
    assert_eq!(config.cache_paths[0].path, Path::new("/srv/quay/cache"));
}

#[test]
fn oldbin_path_appends_suffix() {
    let mut config = parse("pid = \"run/quay.pid\"");
    config.resolve_paths(Path::new("/srv"));
    assert_eq!(config.oldbin_path(), Path::new("/srv/run/quay.pid.oldbin"));
}

#[test]
fn unknown_keys_are_rejected() {
    assert!(load_str("worker_procesess = 2", Path::new("t"), None).is_err());
}
