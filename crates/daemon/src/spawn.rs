// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Child spawning and the channel side of supervision.
//!
//! `spawn_process` allocates (or, on respawn, reuses) a process-table
//! slot, wires up the socketpair channel, forks, and dispatches the child
//! into its entry point; the child never returns. The master-side helpers
//! here broadcast OPEN_CHANNEL/CLOSE_CHANNEL and deliver shutdown
//! commands with a plain-signal fallback.

use std::os::unix::io::{IntoRawFd, RawFd};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::signal::{kill, Signal};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::unistd::{fork, ForkResult, Pid};
use quay_core::channel::{self, ChannelMsg, Command};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::cycle::Cycle;
use crate::process::{ChildKind, Disposition, PROCESS_TABLE, CHANNEL_FD, PROCESS_SLOT};
use crate::signals;
use crate::{cache, upgrade, worker};

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("process table is full")]
    TableFull,

    #[error("socketpair() failed: {0}")]
    Socketpair(#[source] Errno),

    #[error("fork() failed: {0}")]
    Fork(#[source] Errno),
}

/// Fork a child into `kind`. `respawn_slot` reuses a dead child's slot so
/// its bookkeeping survives the pid change. Returns the slot index.
pub fn spawn_process(
    cycle: &Cycle,
    kind: ChildKind,
    name: &'static str,
    disposition: Disposition,
    respawn_slot: Option<usize>,
) -> Result<usize, SpawnError> {
    let slot_index;
    let child_channel: RawFd;

    {
        let mut table = PROCESS_TABLE.lock();
        slot_index = match respawn_slot {
            Some(idx) => idx,
            None => table.reserve().ok_or(SpawnError::TableFull)?,
        };

        let channel = if disposition == Disposition::Detached {
            // The successor is tracked by pid for rollback only.
            [-1, -1]
        } else {
            let (master_end, child_end) = socketpair(
                AddressFamily::Unix,
                SockType::Stream,
                None,
                SockFlag::SOCK_NONBLOCK,
            )
            .map_err(SpawnError::Socketpair)?;
            let pair = [master_end.into_raw_fd(), child_end.into_raw_fd()];
            // Close-on-exec: only listeners may survive an exec into a
            // successor binary, never channels.
            for fd in pair {
                if let Err(e) = fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)) {
                    warn!("fcntl(FD_CLOEXEC) on channel fd failed: {e}");
                }
            }
            pair
        };
        child_channel = channel[1];

        // Fill the slot before forking so the child's copy of the table
        // already describes its own channel and its siblings'.
        let slot = table.slot_mut(slot_index);
        slot.pid = -1;
        slot.status = 0;
        slot.channel = channel;
        slot.kind = Some(kind.clone());
        slot.name = name;
        slot.respawn =
            matches!(disposition, Disposition::Respawn | Disposition::JustRespawn);
        slot.just_spawn =
            matches!(disposition, Disposition::JustSpawn | Disposition::JustRespawn);
        slot.detached = disposition == Disposition::Detached;
        slot.exiting = false;
        slot.exited = false;
        // The lock must not be held across fork: the child would inherit
        // it locked with nobody to unlock.
    }

    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            PROCESS_SLOT.store(slot_index, std::sync::atomic::Ordering::Relaxed);
            CHANNEL_FD.store(child_channel, std::sync::atomic::Ordering::Relaxed);
            run_child(cycle, kind)
        }
        Ok(ForkResult::Parent { child }) => {
            info!(pid = child.as_raw(), slot = slot_index, "start {name}");
            let mut table = PROCESS_TABLE.lock();
            table.slot_mut(slot_index).pid = child.as_raw();
            Ok(slot_index)
        }
        Err(e) => {
            let mut table = PROCESS_TABLE.lock();
            close_channel_fds(&mut table.slot_mut(slot_index).channel);
            table.release(slot_index);
            Err(SpawnError::Fork(e))
        }
    }
}

fn run_child(cycle: &Cycle, kind: ChildKind) -> ! {
    match kind {
        ChildKind::Worker(index) => worker::worker_process_cycle(cycle, index),
        ChildKind::CacheManager => cache::cache_manager_process_cycle(cycle),
        ChildKind::CacheLoader => cache::cache_loader_process_cycle(cycle),
        ChildKind::Exec(ctx) => upgrade::exec_child(&ctx),
    }
}

/// Tell every existing child about the channel of the newest one, so each
/// live worker holds a channel fd for every sibling.
pub fn pass_open_channel(slot_index: usize) {
    let table = PROCESS_TABLE.lock();
    let newest = table.slot(slot_index);
    let msg =
        ChannelMsg::new(Command::OpenChannel, newest.pid, slot_index as i32, newest.channel[0]);

    for (index, other) in table.iter() {
        if index == slot_index || other.pid == -1 || other.channel[0] == -1 {
            continue;
        }
        debug!(
            slot = slot_index,
            pid = newest.pid,
            to_pid = other.pid,
            "pass channel to sibling"
        );
        match channel::write_channel(other.channel[0], &msg) {
            Ok(true) => {}
            Ok(false) => warn!(to_pid = other.pid, "channel full passing OPEN_CHANNEL"),
            Err(e) => warn!(to_pid = other.pid, "passing OPEN_CHANNEL failed: {e}"),
        }
    }
}

/// Tell the remaining children that `slot_index` is gone.
pub fn pass_close_channel(slot_index: usize, pid: i32) {
    let table = PROCESS_TABLE.lock();
    let msg = ChannelMsg::new(Command::CloseChannel, pid, slot_index as i32, -1);

    for (index, other) in table.iter() {
        if index == slot_index || other.exited || other.pid == -1 || other.channel[0] == -1 {
            continue;
        }
        debug!(slot = slot_index, pid, to_pid = other.pid, "pass close channel");
        match channel::write_channel(other.channel[0], &msg) {
            Ok(true) => {}
            Ok(false) => warn!(to_pid = other.pid, "channel full passing CLOSE_CHANNEL"),
            Err(e) => warn!(to_pid = other.pid, "passing CLOSE_CHANNEL failed: {e}"),
        }
    }
}

/// Deliver a shutdown/reopen round to every supervised child: channel
/// command first, `kill` as fallback. ESRCH marks the slot exited and
/// schedules a reap.
pub fn signal_worker_processes(signo: Signal) {
    let command = match signo {
        Signal::SIGQUIT => Some(Command::Quit),
        Signal::SIGTERM => Some(Command::Terminate),
        Signal::SIGUSR1 => Some(Command::Reopen),
        _ => None,
    };
    let marks_exiting = signo != Signal::SIGUSR1;

    let mut table = PROCESS_TABLE.lock();
    for (index, slot) in table.iter_mut() {
        debug!(
            slot = index,
            pid = slot.pid,
            exiting = slot.exiting,
            exited = slot.exited,
            detached = slot.detached,
            respawn = slot.respawn,
            just_spawn = slot.just_spawn,
            "signal sweep"
        );

        if slot.detached || slot.pid == -1 {
            continue;
        }

        // Freshly started children sit out exactly one sweep.
        if slot.just_spawn {
            slot.just_spawn = false;
            continue;
        }

        if slot.exiting && signo == Signal::SIGQUIT {
            continue;
        }

        if let Some(command) = command {
            if slot.channel[0] != -1 {
                let msg = ChannelMsg::new(command, 0, 0, -1);
                if matches!(channel::write_channel(slot.channel[0], &msg), Ok(true)) {
                    if marks_exiting {
                        slot.exiting = true;
                    }
                    continue;
                }
            }
        }

        debug!(pid = slot.pid, signal = %signo, "kill fallback");
        match kill(Pid::from_raw(slot.pid), signo) {
            Ok(()) => {
                if marks_exiting {
                    slot.exiting = true;
                }
            }
            Err(Errno::ESRCH) => {
                slot.exited = true;
                slot.exiting = false;
                signals::REAP.store(true, std::sync::atomic::Ordering::Relaxed);
            }
            Err(e) => {
                error!(pid = slot.pid, signal = %signo, "kill failed: {e}");
            }
        }
    }
}

/// Close both channel ends of a reaped slot.
pub fn close_channel_fds(channel: &mut [RawFd; 2]) {
    for fd in channel.iter_mut() {
        if *fd != -1 {
            if let Err(e) = nix::unistd::close(*fd) {
                error!("close() channel failed: {e}");
            }
            *fd = -1;
        }
    }
}
