// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Log files that survive rotation.
//!
//! The error log is the `tracing` writer for the whole process tree; the
//! access log is a plain line-per-connection file owned by the cycle.
//! REOPEN closes the current descriptor and opens a fresh file at the
//! same path, which is all log rotation needs.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::unistd::{chown, Gid, Uid};
use parking_lot::{Mutex, RwLock};
use tracing::error;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

use crate::cycle::Cycle;

/// Log verbosity override, e.g. `QUAY_LOG=debug`.
pub const LOG_ENV_VAR: &str = "QUAY_LOG";

#[derive(Debug)]
enum Target {
    Stderr,
    File { path: PathBuf, file: File },
}

/// The process error log. Clones share one target; retarget/reopen on any
/// clone is visible to the installed tracing subscriber.
#[derive(Debug, Clone)]
pub struct ErrorLog {
    inner: Arc<RwLock<Target>>,
}

impl ErrorLog {
    pub fn stderr() -> Self {
        Self { inner: Arc::new(RwLock::new(Target::Stderr)) }
    }

    /// Point the log at `path` (or back at stderr with `None`).
    pub fn retarget(&self, path: Option<&Path>) -> io::Result<()> {
        let target = match path {
            Some(path) => Target::File { path: path.to_path_buf(), file: open_log(path)? },
            None => Target::Stderr,
        };
        *self.inner.write() = target;
        Ok(())
    }

    /// Reopen the current file target; no-op for stderr. `owner` restores
    /// worker readability after a privilege drop.
    pub fn reopen(&self, owner: Option<(Uid, Gid)>) -> io::Result<()> {
        let mut target = self.inner.write();
        if let Target::File { path, file } = &mut *target {
            let fresh = open_log(path)?;
            chown_log(path, owner);
            *file = fresh;
        }
        Ok(())
    }

    pub fn path(&self) -> Option<PathBuf> {
        match &*self.inner.read() {
            Target::Stderr => None,
            Target::File { path, .. } => Some(path.clone()),
        }
    }
}

impl Write for ErrorLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &*self.inner.read() {
            Target::Stderr => io::stderr().lock().write(buf),
            Target::File { file, .. } => (&*file).write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &*self.inner.read() {
            Target::Stderr => io::stderr().lock().flush(),
            Target::File { file, .. } => (&*file).flush(),
        }
    }
}

impl<'a> MakeWriter<'a> for ErrorLog {
    type Writer = ErrorLog;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Install the tracing subscriber over the shared error log. Idempotent;
/// the first caller wins.
pub fn init(log: &ErrorLog) {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(log.clone())
        .with_ansi(false)
        .with_target(false)
        .try_init();
}

/// Per-connection access log. One line per closed connection.
#[derive(Debug, Clone)]
pub struct AccessLog {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl AccessLog {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = open_log(path)?;
        Ok(Self { path: path.to_path_buf(), file: Arc::new(Mutex::new(file)) })
    }

    pub fn write_line(&self, line: &str) {
        let mut file = self.file.lock();
        if let Err(e) = writeln!(file, "{line}") {
            error!(path = %self.path.display(), "access log write failed: {e}");
        }
    }

    pub fn reopen(&self, owner: Option<(Uid, Gid)>) -> io::Result<()> {
        let fresh = open_log(&self.path)?;
        chown_log(&self.path, owner);
        *self.file.lock() = fresh;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Reopen every open file of the cycle. `owner` is set only in the
/// master, which may still be root; workers pass `None`.
pub fn reopen_files(cycle: &Cycle, owner: Option<(Uid, Gid)>) {
    if let Err(e) = cycle.error_log.reopen(owner) {
        error!("reopening error log failed: {e}");
    }
    if let Some(access) = &cycle.access_log {
        if let Err(e) = access.reopen(owner) {
            error!(path = %access.path().display(), "reopening access log failed: {e}");
        }
    }
}

/// Verify a log path can be opened and created; config test and cycle
/// validation both want the failure before any worker exists.
pub fn probe(path: &Path) -> io::Result<()> {
    open_log(path).map(drop)
}

fn open_log(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn chown_log(path: &Path, owner: Option<(Uid, Gid)>) {
    if let Some((uid, gid)) = owner {
        if let Err(e) = chown(path, Some(uid), Some(gid)) {
            error!(path = %path.display(), "chown on reopened log failed: {e}");
        }
    }
}

#[cfg(test)]
#[path = "logfile_tests.rs"]
mod tests;
