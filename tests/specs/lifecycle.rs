// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Master/worker lifecycle specs: spawn, respawn, graceful and fast
//! shutdown, reload, log rotation, and binary upgrade rollback.

use assert_cmd::Command;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serial_test::serial;

use crate::prelude::*;

#[test]
#[serial]
fn master_starts_workers_and_quits_gracefully() {
    let mut server = TestServer::start("worker_processes = 1");

    assert!(server.pid_path().exists());
    assert!(wait_for(SPEC_WAIT_MAX_MS, || !server.worker_pids().is_empty()));

    let mut conn = server.connect();
    server.echo(&mut conn, b"hello quay\n");
    drop(conn);

    // Graceful shutdown through the signaller binary.
    Command::cargo_bin("quay")
        .expect("quay binary")
        .arg("-p")
        .arg(server.dir.path())
        .args(["-s", "quit"])
        .assert()
        .code(0);

    let status = server.wait_exit(SPEC_WAIT_MAX_MS).expect("master exit");
    assert_eq!(status.code(), Some(0));
    assert!(!server.pid_path().exists(), "pid file must be deleted on exit");
}

#[test]
#[serial]
fn terminate_stops_everything_fast() {
    let mut server = TestServer::start("worker_processes = 2");
    assert!(wait_for(SPEC_WAIT_MAX_MS, || server.worker_pids().len() == 2));

    // Open connections do not delay a fast terminate.
    let _conn_a = server.connect();
    let _conn_b = server.connect();

    server.signal(Signal::SIGTERM);
    let status = server.wait_exit(SPEC_WAIT_MAX_MS).expect("master exit");
    assert_eq!(status.code(), Some(0));
    assert!(!server.pid_path().exists());
}

#[test]
#[serial]
fn a_killed_worker_is_respawned() {
    let server = TestServer::start("worker_processes = 1");
    assert!(wait_for(SPEC_WAIT_MAX_MS, || server.worker_pids().len() == 1));
    let before = server.worker_pids()[0];

    kill(Pid::from_raw(before), Signal::SIGKILL).expect("kill worker");

    assert!(
        wait_for(SPEC_WAIT_MAX_MS, || {
            let workers = server.worker_pids();
            workers.len() == 1 && workers[0] != before
        }),
        "worker was not respawned; stderr:\n{}",
        server.stderr()
    );

    // The replacement serves the same listener.
    let mut conn = server.connect();
    server.echo(&mut conn, b"respawned\n");
}

#[test]
#[serial]
fn reload_swaps_the_worker_set_and_preserves_connections() {
    let server = TestServer::start("worker_processes = 1");
    assert!(wait_for(SPEC_WAIT_MAX_MS, || server.worker_pids().len() == 1));
    let old_worker = server.worker_pids()[0];

    // A connection with traffic on it: the draining worker must carry it
    // until we close.
    let mut held = server.connect();
    server.echo(&mut held, b"before reload\n");

    server.rewrite_conf("worker_processes = 2");
    server.signal(Signal::SIGHUP);

    // Two new workers come up; the old one drains our held connection.
    assert!(
        wait_for(SPEC_WAIT_MAX_MS, || {
            let workers = server.worker_pids();
            workers.iter().filter(|pid| **pid != old_worker).count() == 2
        }),
        "new worker set did not come up; stderr:\n{}",
        server.stderr()
    );

    // The held connection still answers after the reload.
    server.echo(&mut held, b"across reload\n");

    // New connections are served by the new generation.
    let mut fresh = server.connect();
    server.echo(&mut fresh, b"new generation\n");

    // Releasing the held connection lets the old worker finish draining.
    drop(held);
    assert!(
        wait_for(SPEC_WAIT_MAX_MS, || !server.worker_pids().contains(&old_worker)),
        "old worker never exited; stderr:\n{}",
        server.stderr()
    );
}

#[test]
#[serial]
fn reload_with_a_broken_config_is_non_destructive() {
    let server = TestServer::start("worker_processes = 1");
    assert!(wait_for(SPEC_WAIT_MAX_MS, || server.worker_pids().len() == 1));
    let worker = server.worker_pids()[0];

    std::fs::write(server.dir.path().join("quay.toml"), "worker_processes = = broken")
        .expect("break conf");
    server.signal(Signal::SIGHUP);

    // The master logs the failure and keeps the old cycle: same worker,
    // same listener.
    assert!(wait_for(SPEC_WAIT_MAX_MS, || server.stderr().contains("reload failed")));
    assert_eq!(server.worker_pids(), vec![worker]);

    let mut conn = server.connect();
    server.echo(&mut conn, b"still serving\n");
}

#[test]
#[serial]
fn reopen_rotates_the_logs() {
    let server = TestServer::start(
        "worker_processes = 1\nerror_log = \"logs/error.log\"\naccess_log = \"logs/access.log\"",
    );
    let error_log = server.dir.path().join("logs/error.log");
    assert!(wait_for(SPEC_WAIT_MAX_MS, || error_log.exists()));

    // Produce one closed connection so the access log has content.
    let mut conn = server.connect();
    server.echo(&mut conn, b"logged\n");
    drop(conn);
    let access_log = server.dir.path().join("logs/access.log");
    assert!(wait_for(SPEC_WAIT_MAX_MS, || {
        std::fs::read_to_string(&access_log).unwrap_or_default().contains("in=7")
    }));

    // Rotate both files out from under the server.
    std::fs::rename(&error_log, server.dir.path().join("logs/error.log.1")).expect("rotate");
    std::fs::rename(&access_log, server.dir.path().join("logs/access.log.1")).expect("rotate");

    server.signal(Signal::SIGUSR1);
    assert!(
        wait_for(SPEC_WAIT_MAX_MS, || error_log.exists()),
        "error log was not recreated; stderr:\n{}",
        server.stderr()
    );

    // Lines logged after the rotation land in the fresh access log.
    let mut conn = server.connect();
    server.echo(&mut conn, b"after rotate\n");
    drop(conn);
    assert!(wait_for(SPEC_WAIT_MAX_MS, || {
        std::fs::read_to_string(&access_log).unwrap_or_default().contains("in=13")
    }));
}

#[test]
#[serial]
fn binary_upgrade_rolls_back_when_the_successor_dies() {
    let server = TestServer::start("worker_processes = 1");
    assert!(wait_for(SPEC_WAIT_MAX_MS, || server.worker_pids().len() == 1));
    let old_master = server.master_pid();

    server.signal(Signal::SIGUSR2);

    // The old PID file moves aside and the successor writes its own.
    assert!(
        wait_for(SPEC_WAIT_MAX_MS, || {
            server.oldbin_path().exists()
                && server.pid_path().exists()
                && read_pid(&server.pid_path()) != old_master
        }),
        "successor never started; stderr:\n{}",
        server.stderr()
    );
    let successor = read_pid(&server.pid_path());
    assert_eq!(read_pid(&server.oldbin_path()), old_master);

    // The successor's workers share the inherited listener.
    assert!(wait_for(SPEC_WAIT_MAX_MS, || !children_of(successor).is_empty()));
    let mut conn = server.connect();
    server.echo(&mut conn, b"during upgrade\n");

    // Abort the upgrade: terminate the successor; the old master notices
    // and moves its PID file back.
    kill(Pid::from_raw(successor), Signal::SIGTERM).expect("terminate successor");
    assert!(
        wait_for(SPEC_WAIT_MAX_MS, || {
            !server.oldbin_path().exists() && read_pid(&server.pid_path()) == old_master
        }),
        "rollback did not restore the pid file; stderr:\n{}",
        server.stderr()
    );

    // The old generation never stopped serving.
    let mut conn = server.connect();
    server.echo(&mut conn, b"after rollback\n");
}
