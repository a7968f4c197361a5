// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn opts(args: &[&str]) -> Options {
    let mut full = vec!["quay"];
    full.extend_from_slice(args);
    Options::try_parse_from(full).unwrap()
}

#[test]
fn defaults_resolve_against_the_cwd() {
    let boot = boot_info(&opts(&[])).unwrap();
    let cwd = std::env::current_dir().unwrap();
    assert_eq!(boot.prefix, cwd);
    assert_eq!(boot.conf_file, cwd.join("quay.toml"));
    assert!(boot.error_log.is_none());
    assert!(boot.directives.is_none());
}

#[test]
fn relative_conf_is_rebased_on_the_prefix() {
    let boot = boot_info(&opts(&["-p", "/srv/quay", "-c", "conf/custom.toml"])).unwrap();
    assert_eq!(boot.conf_file, Path::new("/srv/quay/conf/custom.toml"));

    let boot = boot_info(&opts(&["-p", "/srv/quay", "-c", "/etc/quay.toml"])).unwrap();
    assert_eq!(boot.conf_file, Path::new("/etc/quay.toml"));
}

#[test]
fn error_log_stderr_is_special_cased() {
    let boot = boot_info(&opts(&["-e", "stderr"])).unwrap();
    assert!(matches!(boot.error_log, Some(LogTarget::Stderr)));

    let boot = boot_info(&opts(&["-e", "logs/err.log"])).unwrap();
    assert!(matches!(boot.error_log, Some(LogTarget::File(_))));
}

#[test]
fn directives_pass_through() {
    let boot = boot_info(&opts(&["-g", "daemon = false"])).unwrap();
    assert_eq!(boot.directives.as_deref(), Some("daemon = false"));
}

#[test]
fn signal_flag_parses() {
    assert_eq!(opts(&["-s", "reload"]).signal.as_deref(), Some("reload"));
}
