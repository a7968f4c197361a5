// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The process table.
//!
//! Children are addressed by small slot indices, never by pid alone, so
//! per-slot bookkeeping (channel fds, flags) survives pid reuse. The table
//! is a process-wide global duplicated into every child by fork; each
//! process mutates only its own copy.

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::upgrade::ExecCtx;

/// Hard cap on supervised children.
pub const MAX_PROCESSES: usize = 1024;

/// What the supervisor does when a child exits, and whether the child is
/// exempt from the next signal sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// One-shot helper.
    NoRespawn,
    /// One-shot helper exempt from the upcoming signal sweep.
    JustSpawn,
    /// Restart on exit.
    Respawn,
    /// Restart on exit, exempt from the upcoming sweep (new generation
    /// during reload).
    JustRespawn,
    /// Upgrade successor: neither respawned nor signalled.
    Detached,
}

/// Child entry point, kept in the slot so a respawn re-runs the same one.
#[derive(Debug, Clone)]
pub enum ChildKind {
    /// Worker with its index (drives CPU affinity).
    Worker(i64),
    CacheManager,
    CacheLoader,
    /// Binary-upgrade successor: fork + exec.
    Exec(Arc<ExecCtx>),
}

#[derive(Debug, Clone)]
pub struct ProcessSlot {
    /// -1 while the slot is empty.
    pub pid: i32,
    /// Raw wait status captured at reap time.
    pub status: i32,
    /// Socketpair: `channel[0]` is the master's end, `channel[1]` the
    /// child's. -1 once closed.
    pub channel: [RawFd; 2],
    pub kind: Option<ChildKind>,
    pub name: &'static str,
    pub respawn: bool,
    pub just_spawn: bool,
    pub detached: bool,
    /// A shutdown command or signal has been delivered.
    pub exiting: bool,
    /// SIGCHLD observed; slot awaits the reap sweep.
    pub exited: bool,
}

impl ProcessSlot {
    fn empty() -> Self {
        Self {
            pid: -1,
            status: 0,
            channel: [-1, -1],
            kind: None,
            name: "",
            respawn: false,
            just_spawn: false,
            detached: false,
            exiting: false,
            exited: false,
        }
    }

    pub fn occupied(&self) -> bool {
        self.pid != -1
    }
}

#[derive(Debug)]
pub struct ProcessTable {
    slots: Vec<ProcessSlot>,
    /// High-water mark: slots at or past this index have never been used.
    pub last: usize,
}

impl ProcessTable {
    pub const fn new() -> Self {
        Self { slots: Vec::new(), last: 0 }
    }

    /// Find a slot for a new child: the first empty slot below the
    /// high-water mark, or a fresh one. `None` when the table is full.
    pub fn reserve(&mut self) -> Option<usize> {
        for idx in 0..self.last {
            if !self.slots[idx].occupied() {
                return Some(idx);
            }
        }
        if self.last >= MAX_PROCESSES {
            return None;
        }
        let idx = self.last;
        self.ensure(idx);
        self.last += 1;
        Some(idx)
    }

    /// Grow the backing vector so `idx` is addressable (channel handlers
    /// install peers into slots this process has never spawned into).
    pub fn ensure(&mut self, idx: usize) {
        if idx >= self.slots.len() {
            self.slots.resize_with(idx + 1, ProcessSlot::empty);
        }
        if idx >= self.last {
            self.last = idx + 1;
        }
    }

    pub fn slot(&self, idx: usize) -> &ProcessSlot {
        &self.slots[idx]
    }

    pub fn slot_mut(&mut self, idx: usize) -> &mut ProcessSlot {
        &mut self.slots[idx]
    }

    /// Reclaim a reaped slot. The top slot lowers the high-water mark;
    /// interior slots just become empty.
    pub fn release(&mut self, idx: usize) {
        if idx + 1 == self.last {
            self.last -= 1;
            self.slots[idx] = ProcessSlot::empty();
        } else {
            self.slots[idx].pid = -1;
        }
    }

    /// Record a wait status for a child; returns its slot when known.
    pub fn mark_exited(&mut self, pid: i32, status: i32) -> Option<usize> {
        for idx in 0..self.last {
            let slot = &mut self.slots[idx];
            if slot.pid == pid {
                slot.exited = true;
                slot.status = status;
                return Some(idx);
            }
        }
        None
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &ProcessSlot)> {
        self.slots.iter().enumerate().take(self.last)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut ProcessSlot)> {
        self.slots.iter_mut().enumerate().take(self.last)
    }
}

/// The one table. Fork duplicates it; the copies diverge from there.
pub static PROCESS_TABLE: Mutex<ProcessTable> = Mutex::new(ProcessTable::new());

/// This process's own slot (children only).
pub static PROCESS_SLOT: AtomicUsize = AtomicUsize::new(0);

/// This child's end of its channel; -1 in the master.
pub static CHANNEL_FD: AtomicI32 = AtomicI32::new(-1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Role {
    Single = 0,
    Master = 1,
    Signaller = 2,
    Worker = 3,
    Helper = 4,
}

static ROLE: AtomicU8 = AtomicU8::new(Role::Single as u8);

pub fn set_role(role: Role) {
    ROLE.store(role as u8, Ordering::Relaxed);
}

pub fn role() -> Role {
    match ROLE.load(Ordering::Relaxed) {
        1 => Role::Master,
        2 => Role::Signaller,
        3 => Role::Worker,
        4 => Role::Helper,
        _ => Role::Single,
    }
}

/// Set the kernel-visible process name (15-byte cap applies).
pub fn set_title(title: &str) {
    let Ok(name) = CString::new(title.as_bytes().iter().take(15).copied().collect::<Vec<_>>())
    else {
        return;
    };
    // PR_SET_NAME replaces the argv rewrite the kernel does not let us do
    // portably.
    unsafe {
        libc::prctl(libc::PR_SET_NAME, name.as_ptr());
    }
}

#[cfg(test)]
#[path = "process_tests.rs"]
mod tests;
