// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::cycle::{BootInfo, Cycle, InitOptions};
use crate::logfile::ErrorLog;

fn cycle_with_cache(conf: &str) -> (tempfile::TempDir, Cycle) {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("quay.toml"), conf).unwrap();
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
fn manager_prunes_expired_entries_and_suggests_the_interval() {
    let (dir, cycle) = cycle_with_cache(
        r#"
[[cache_path]]
path = "cache"
manager = true
inactive = 1
interval = 2000
"#,
    );

    let stale = dir.path().join("cache/deep/entry");
    std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
    std::fs::write(&stale, b"payload").unwrap();
    // Make sure the file's mtime falls behind the 1 ms window.
    std::thread::sleep(Duration::from_millis(50));

    let next = manager_pass(&cycle);
    assert!(!stale.exists(), "expired entry must be pruned");
    assert_eq!(next, Duration::from_millis(2000));
}

#[test]
fn manager_keeps_fresh_entries() {
    let (dir, cycle) = cycle_with_cache(
        r#"
[[cache_path]]
path = "cache"
manager = true
inactive = 600000
"#,
    );

    let fresh = dir.path().join("cache/entry");
    std::fs::write(&fresh, b"payload").unwrap();

    manager_pass(&cycle);
    assert!(fresh.exists(), "fresh entry must survive");
}

#[test]
fn manager_delay_is_floored() {
    let (_dir, cycle) = cycle_with_cache(
        r#"
[[cache_path]]
path = "cache"
manager = true
interval = 0
"#,
    );
    assert_eq!(manager_pass(&cycle), Duration::from_millis(1));
}

#[test]
fn loader_walks_only_loader_paths() {
    let (dir, cycle) = cycle_with_cache(
        r#"
[[cache_path]]
path = "warm"
loader = true

[[cache_path]]
path = "cold"
"#,
    );
    std::fs::write(dir.path().join("warm/a"), b"1").unwrap();
    std::fs::write(dir.path().join("cold/b"), b"2").unwrap();

    // Smoke: the pass completes and leaves the trees alone.
    loader_pass(&cycle);
    assert!(dir.path().join("warm/a").exists());
    assert!(dir.path().join("cold/b").exists());
}
