// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! PID file management.
//!
//! The master owns the PID file exclusively: written after daemonizing,
//! renamed to `<path>.oldbin` for the duration of a binary upgrade, and
//! deleted on master exit. An flock on the open descriptor rejects a
//! second master against the same file.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PidError {
    #[error("pid file {} is locked: is another master running?", .0.display())]
    AlreadyRunning(PathBuf),

    #[error("pid file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("pid file {} does not contain a pid", .0.display())]
    Malformed(PathBuf),
}

/// The held PID file. Keeps the descriptor (and its lock) open for the
/// master's lifetime.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    file: File,
}

/// Create the PID file and write our pid. Open without truncation first
/// so a losing race does not wipe the running master's pid.
pub fn create(path: &Path) -> Result<PidFile, PidError> {
    let io_err = |source| PidError::Io { path: path.to_path_buf(), source };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
    }

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o644)
        .open(path)
        .map_err(io_err)?;

    file.try_lock_exclusive().map_err(|_| PidError::AlreadyRunning(path.to_path_buf()))?;

    file.set_len(0).map_err(io_err)?;
    writeln!(file, "{}", std::process::id()).map_err(io_err)?;
    file.flush().map_err(io_err)?;

    Ok(PidFile { path: path.to_path_buf(), file })
}

/// Read a master pid back from a PID file.
pub fn read(path: &Path) -> Result<i32, PidError> {
    let text = std::fs::read_to_string(path)
        .map_err(|source| PidError::Io { path: path.to_path_buf(), source })?;
    text.trim()
        .parse::<i32>()
        .ok()
        .filter(|pid| *pid > 0)
        .ok_or_else(|| PidError::Malformed(path.to_path_buf()))
}

impl PidFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Move the PID file (upgrade rename and its rollback). The held lock
    /// follows the inode.
    pub fn rename(&mut self, to: &Path) -> std::io::Result<()> {
        std::fs::rename(&self.path, to)?;
        self.path = to.to_path_buf();
        Ok(())
    }

    /// Delete on master exit. Consumes the handle; the lock dies with it.
    pub fn delete(self) {
        let _ = std::fs::remove_file(&self.path);
        drop(self.file);
    }
}

#[cfg(test)]
#[path = "pid_tests.rs"]
mod tests;
