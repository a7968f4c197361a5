// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Live binary upgrade.
//!
//! The master forks a detached child that execs the (possibly replaced)
//! binary with the same argv. Listener descriptors survive exec (they are
//! not close-on-exec) and their numbers ride in the `QUAY` environment
//! variable; the successor adopts them instead of binding. The old
//! master's PID file moves aside to `<path>.oldbin` until the upgrade
//! commits or rolls back.

use std::ffi::{CString, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use nix::unistd::execve;
use thiserror::Error;
use tracing::error;

use crate::cycle::Cycle;
use crate::environment;
use crate::pid::PidFile;
use crate::process::{ChildKind, Disposition};
use crate::spawn::{self, SpawnError};

/// Environment variable carrying inherited listener descriptors,
/// `fd1;fd2;...;`. Colons are accepted on input for compatibility.
pub const LISTENER_FDS_VAR: &str = "QUAY";

/// Everything the forked child needs to exec the successor.
#[derive(Debug)]
pub struct ExecCtx {
    pub path: OsString,
    pub argv: Vec<OsString>,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("renaming pid file for upgrade failed: {0}")]
    RenamePid(#[source] std::io::Error),

    #[error(transparent)]
    Spawn(#[from] SpawnError),
}

/// The `QUAY` value for this cycle: every non-ignored open listener.
pub fn listener_fds_value(cycle: &Cycle) -> String {
    let mut value = String::new();
    for listener in &cycle.listeners {
        if listener.ignore {
            continue;
        }
        if let Some(fd) = listener.raw_fd() {
            value.push_str(&fd.to_string());
            value.push(';');
        }
    }
    value
}

/// Start the successor binary. Returns its pid; the caller supervises old
/// workers as before and watches this pid for rollback.
pub fn exec_new_binary(
    cycle: &Cycle,
    argv: &[OsString],
    pid_file: &mut PidFile,
    oldbin: &Path,
) -> Result<i32, UpgradeError> {
    let mut env = environment::build(&cycle.config);
    env.push((LISTENER_FDS_VAR.to_string(), listener_fds_value(cycle)));

    let path = argv.first().cloned().unwrap_or_else(|| OsString::from("quay"));
    let ctx = ExecCtx { path, argv: argv.to_vec(), env };

    let primary = pid_file.path().to_path_buf();
    pid_file.rename(oldbin).map_err(UpgradeError::RenamePid)?;

    match spawn::spawn_process(
        cycle,
        ChildKind::Exec(ctx.into()),
        "new binary process",
        Disposition::Detached,
        None,
    ) {
        Ok(slot) => {
            let pid = crate::process::PROCESS_TABLE.lock().slot(slot).pid;
            Ok(pid)
        }
        Err(e) => {
            // Failed before exec: put the PID file back.
            if let Err(rename_err) = pid_file.rename(&primary) {
                error!(
                    "renaming {} back to {} failed after a failed upgrade: {rename_err}",
                    oldbin.display(),
                    primary.display()
                );
            }
            Err(e.into())
        }
    }
}

/// Child side: exec the successor. Never returns; an exec failure exits
/// with status 1, which the master's reap sweep treats as an aborted
/// upgrade and rolls back.
pub fn exec_child(ctx: &ExecCtx) -> ! {
    let to_cstring = |bytes: &[u8]| CString::new(bytes.to_vec()).ok();

    let Some(path) = to_cstring(ctx.path.as_bytes()) else {
        error!("invalid executable path for upgrade");
        std::process::exit(1);
    };
    let argv: Vec<CString> =
        ctx.argv.iter().filter_map(|a| to_cstring(a.as_bytes())).collect();
    let env: Vec<CString> = ctx
        .env
        .iter()
        .filter_map(|(k, v)| to_cstring(format!("{k}={v}").as_bytes()))
        .collect();

    match execve(&path, &argv, &env) {
        Ok(infallible) => match infallible {},
        Err(e) => {
            error!(path = %ctx.path.to_string_lossy(), "execve for upgrade failed: {e}");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
#[path = "upgrade_tests.rs"]
mod tests;
