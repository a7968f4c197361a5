// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared helpers for the spec suite.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

/// Generous ceiling for anything that involves process scheduling.
pub const SPEC_WAIT_MAX_MS: u64 = 5_000;

pub fn quay_bin() -> PathBuf {
    assert_cmd::cargo::cargo_bin("quay")
}

/// Poll `check` every 20 ms until it holds or the deadline passes.
pub fn wait_for(timeout_ms: u64, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

/// Grab an ephemeral port the kernel considers free right now.
pub fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind to port 0");
    listener.local_addr().expect("local addr").port()
}

/// One foreground master under a temp prefix, killed on drop.
pub struct TestServer {
    pub dir: tempfile::TempDir,
    pub port: u16,
    child: Child,
}

impl TestServer {
    /// Start a master with `daemon = false`, one listener on an ephemeral
    /// port, and `body` merged in. `body` must contain only top-level
    /// keys.
    pub fn start(body: &str) -> TestServer {
        let port = free_port();
        let conf = format!(
            "daemon = false\n{body}\n[[listen]]\naddr = \"127.0.0.1:{port}\"\n"
        );
        Self::start_raw(&conf, port)
    }

    /// Start from a complete config; `port` must match a listener inside.
    pub fn start_raw(conf: &str, port: u16) -> TestServer {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("quay.toml"), conf).expect("write conf");

        let stderr = std::fs::File::create(dir.path().join("stderr.log")).expect("stderr log");
        let child = Command::new(quay_bin())
            .arg("-p")
            .arg(dir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(stderr)
            .spawn()
            .expect("spawn quay");

        let server = TestServer { dir, port, child };

        assert!(
            wait_for(SPEC_WAIT_MAX_MS, || server.pid_path().exists()),
            "pid file never appeared; stderr:\n{}",
            server.stderr()
        );
        assert!(
            wait_for(SPEC_WAIT_MAX_MS, || server.try_connect().is_some()),
            "listener never became connectable; stderr:\n{}",
            server.stderr()
        );
        server
    }

    pub fn pid_path(&self) -> PathBuf {
        self.dir.path().join("quay.pid")
    }

    pub fn oldbin_path(&self) -> PathBuf {
        self.dir.path().join("quay.pid.oldbin")
    }

    pub fn master_pid(&self) -> i32 {
        read_pid(&self.pid_path())
    }

    /// Direct children of the master, via procfs.
    pub fn worker_pids(&self) -> Vec<i32> {
        children_of(self.master_pid())
    }

    pub fn signal(&self, signal: Signal) {
        kill(Pid::from_raw(self.master_pid()), signal).expect("kill master");
    }

    pub fn rewrite_conf(&self, body: &str) {
        let conf = format!(
            "daemon = false\n{body}\n[[listen]]\naddr = \"127.0.0.1:{}\"\n",
            self.port
        );
        std::fs::write(self.dir.path().join("quay.toml"), conf).expect("rewrite conf");
    }

    pub fn try_connect(&self) -> Option<TcpStream> {
        TcpStream::connect(("127.0.0.1", self.port)).ok()
    }

    pub fn connect(&self) -> TcpStream {
        let stream = self.try_connect().expect("connect to server");
        stream.set_read_timeout(Some(Duration::from_secs(3))).expect("read timeout");
        stream
    }

    /// Round-trip a line through the echo service.
    pub fn echo(&self, stream: &mut TcpStream, payload: &[u8]) {
        stream.write_all(payload).expect("write payload");
        let mut buf = vec![0u8; payload.len()];
        stream.read_exact(&mut buf).expect("read echo");
        assert_eq!(buf, payload);
    }

    pub fn wait_exit(&mut self, timeout_ms: u64) -> Option<ExitStatus> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            if let Ok(Some(status)) = self.child.try_wait() {
                return Some(status);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    pub fn stderr(&self) -> String {
        std::fs::read_to_string(self.dir.path().join("stderr.log")).unwrap_or_default()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = kill(Pid::from_raw(self.child.id() as i32), Signal::SIGKILL);
        let _ = self.child.wait();
    }
}

pub fn read_pid(path: &Path) -> i32 {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|text| text.trim().parse().ok())
        .unwrap_or(-1)
}

/// Direct children of `pid` from `/proc/<pid>/task/<pid>/children`.
pub fn children_of(pid: i32) -> Vec<i32> {
    let path = format!("/proc/{pid}/task/{pid}/children");
    std::fs::read_to_string(path)
        .map(|text| text.split_whitespace().filter_map(|p| p.parse().ok()).collect())
        .unwrap_or_default()
}
