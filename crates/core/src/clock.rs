// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cached wall-clock time.
//!
//! Supervisor processes spend most of their life suspended in `sigsuspend`
//! or `poll`; they refresh this cache once per wakeup instead of calling
//! into the clock on every log line or timer comparison.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static CACHED_MS: AtomicU64 = AtomicU64::new(0);

/// Refresh the cached time. Called after every `sigsuspend`/`poll` return.
pub fn update() {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    CACHED_MS.store(ms, Ordering::Relaxed);
}

/// Milliseconds since the epoch as of the last `update()`.
pub fn now_ms() -> u64 {
    let ms = CACHED_MS.load(Ordering::Relaxed);
    if ms != 0 {
        return ms;
    }
    update();
    CACHED_MS.load(Ordering::Relaxed)
}

/// Cached time split into whole seconds and the millisecond remainder,
/// the shape the worker PRNG seed wants.
pub fn now_parts() -> (u64, u32) {
    let ms = now_ms();
    (ms / 1000, (ms % 1000) as u32)
}

#[cfg(test)]
#[path = "clock_tests.rs"]
mod tests;
