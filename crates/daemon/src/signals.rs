// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Signal handling.
//!
//! Handlers are restricted to a single relaxed store into one of the
//! atomic flags below; the master observes the flags after `sigsuspend`
//! returns, workers between event-loop ticks. Multiple arrivals of the
//! same signal coalesce, which every consumer treats as at-least-once.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::errno::Errno;
use nix::libc::c_int;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use nix::unistd::Pid;
use quay_conf::DebugPoints;
use thiserror::Error;

use crate::pid::{self, PidError};

/// SIGCHLD arrived; run the reap sweep.
pub static REAP: AtomicBool = AtomicBool::new(false);
/// The termination interval timer fired.
pub static SIGALRM: AtomicBool = AtomicBool::new(false);
/// Fast shutdown (SIGTERM/SIGINT or a TERMINATE channel command).
pub static TERMINATE: AtomicBool = AtomicBool::new(false);
/// Graceful shutdown (SIGQUIT or a QUIT channel command).
pub static QUIT: AtomicBool = AtomicBool::new(false);
/// Reload configuration (SIGHUP).
pub static RECONFIGURE: AtomicBool = AtomicBool::new(false);
/// Reopen log files (SIGUSR1 or a REOPEN channel command).
pub static REOPEN: AtomicBool = AtomicBool::new(false);
/// Start the successor binary (SIGUSR2).
pub static CHANGE_BINARY: AtomicBool = AtomicBool::new(false);
/// Stop accepting new connections (SIGWINCH).
pub static NOACCEPT: AtomicBool = AtomicBool::new(false);

/// Consume a flag.
pub fn take(flag: &AtomicBool) -> bool {
    flag.swap(false, Ordering::Relaxed)
}

extern "C" fn signal_handler(signo: c_int) {
    let flag = match Signal::try_from(signo) {
        Ok(Signal::SIGCHLD) => &REAP,
        Ok(Signal::SIGALRM) => &SIGALRM,
        Ok(Signal::SIGTERM) | Ok(Signal::SIGINT) => &TERMINATE,
        Ok(Signal::SIGQUIT) => &QUIT,
        Ok(Signal::SIGHUP) => &RECONFIGURE,
        Ok(Signal::SIGUSR1) => &REOPEN,
        Ok(Signal::SIGUSR2) => &CHANGE_BINARY,
        Ok(Signal::SIGWINCH) => &NOACCEPT,
        // SIGIO and anything else only exist to interrupt the wait.
        _ => return,
    };
    flag.store(true, Ordering::Relaxed);
}

const HANDLED: &[Signal] = &[
    Signal::SIGCHLD,
    Signal::SIGALRM,
    Signal::SIGIO,
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGQUIT,
    Signal::SIGHUP,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGWINCH,
];

/// Install the flag-setting handlers and ignore SIGPIPE. Called once
/// before any fork so every child inherits the same dispositions.
pub fn init_signals() -> Result<(), Errno> {
    // No SA_RESTART: poll and sigsuspend must return with EINTR so the
    // loops get to look at the flags.
    let action =
        SigAction::new(SigHandler::Handler(signal_handler), SaFlags::empty(), SigSet::empty());
    for sig in HANDLED {
        unsafe { signal::sigaction(*sig, &action)? };
    }

    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    unsafe { signal::sigaction(Signal::SIGPIPE, &ignore)? };
    Ok(())
}

/// The set the master keeps blocked outside `sigsuspend`.
pub fn master_sigmask() -> SigSet {
    let mut set = SigSet::empty();
    for sig in HANDLED {
        set.add(*sig);
    }
    set
}

pub fn block(set: &SigSet) -> Result<(), Errno> {
    signal::sigprocmask(SigmaskHow::SIG_BLOCK, Some(set), None)
}

/// Clear the blocked mask entirely (worker init step after fork).
pub fn unblock_all() -> Result<(), Errno> {
    signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)
}

/// Atomically unblock everything and wait for one signal.
pub fn suspend() {
    let _ = SigSet::empty().suspend();
}

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("unknown signal name {0:?} (expected stop, quit, reopen, or reload)")]
    UnknownName(String),

    #[error(transparent)]
    Pid(#[from] PidError),

    #[error("kill({pid}, {signal}) failed: {source}")]
    Kill {
        pid: i32,
        signal: Signal,
        #[source]
        source: Errno,
    },
}

/// Map a `-s` name onto the signal delivered to the running master.
pub fn signal_for_name(name: &str) -> Option<Signal> {
    match name {
        "stop" => Some(Signal::SIGTERM),
        "quit" => Some(Signal::SIGQUIT),
        "reopen" => Some(Signal::SIGUSR1),
        "reload" => Some(Signal::SIGHUP),
        _ => None,
    }
}

/// `-s` implementation: read the PID file and deliver the signal.
pub fn signal_process(pid_path: &Path, name: &str) -> Result<(), SignalError> {
    let signal =
        signal_for_name(name).ok_or_else(|| SignalError::UnknownName(name.to_string()))?;
    let target = pid::read(pid_path)?;
    signal::kill(Pid::from_raw(target), signal).map_err(|source| SignalError::Kill {
        pid: target,
        signal,
        source,
    })?;
    Ok(())
}

/// Leak diagnostics hook: stop for a debugger or abort, per
/// `debug_points`.
pub fn debug_point(points: Option<DebugPoints>) {
    match points {
        Some(DebugPoints::Stop) => {
            let _ = signal::raise(Signal::SIGSTOP);
        }
        Some(DebugPoints::Abort) => std::process::abort(),
        None => {}
    }
}

#[cfg(test)]
#[path = "signals_tests.rs"]
mod tests;
