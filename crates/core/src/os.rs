// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! OS probe: page size, online CPUs, descriptor limit, and the process PRNG.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use nix::sys::resource::{getrlimit, Resource};
use nix::unistd::{sysconf, SysconfVar};

/// Values probed once at startup and consulted throughout the process tree.
#[derive(Debug, Clone, Copy)]
pub struct OsInfo {
    pub pagesize: usize,
    /// Online CPU count; `worker_processes = "auto"` resolves to this.
    pub ncpu: usize,
    /// Soft RLIMIT_NOFILE at startup, the default connection budget.
    pub rlimit_nofile: u64,
}

static OS_INFO: OnceLock<OsInfo> = OnceLock::new();

/// Probe the OS once and cache the result. Safe to call from any process;
/// children inherit the parent's cached copy across fork.
pub fn info() -> OsInfo {
    *OS_INFO.get_or_init(probe)
}

pub fn ncpu() -> usize {
    info().ncpu
}

fn probe() -> OsInfo {
    let pagesize = sysconf(SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .and_then(|v| usize::try_from(v).ok())
        .unwrap_or(4096);

    let ncpu = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);

    let rlimit_nofile = getrlimit(Resource::RLIMIT_NOFILE).map(|(soft, _hard)| soft).unwrap_or(1024);

    OsInfo { pagesize, ncpu, rlimit_nofile }
}

// Process-wide PRNG, reseeded in every child after fork so siblings do not
// share a sequence. xorshift64*; not for anything cryptographic.
static RNG_STATE: AtomicU64 = AtomicU64::new(0x2545_f491_4f6c_dd1d);

/// Seed the process PRNG. A zero seed is remapped; xorshift has a zero
/// fixed point.
pub fn srand(seed: u64) {
    RNG_STATE.store(if seed == 0 { 0x9e37_79b9_7f4a_7c15 } else { seed }, Ordering::Relaxed);
}

pub fn random() -> u64 {
    let mut x = RNG_STATE.load(Ordering::Relaxed);
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    RNG_STATE.store(x, Ordering::Relaxed);
    x.wrapping_mul(0x2545_f491_4f6c_dd1d)
}

#[cfg(test)]
#[path = "os_tests.rs"]
mod tests;
