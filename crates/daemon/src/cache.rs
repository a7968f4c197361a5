// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cache helper processes.
//!
//! The cache manager loops forever, pruning expired entries from every
//! managed path and sleeping for the smallest suggested interval. The
//! cache loader runs once: after a fixed startup delay it walks each
//! loader path to warm whatever state wants warming, then exits. Both are
//! stripped-down workers: no listeners, a modest connection budget, and
//! the same channel discipline as everyone else.

use std::path::Path;
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::cycle::{CachePath, Cycle};
use crate::event::{EventLoop, TimerKey, Wakeup};
use crate::process::{self, Role, CHANNEL_FD};
use crate::signals::{self, QUIT, REOPEN, TERMINATE};
use crate::{logfile, worker};

/// Fixed delay before the loader's single pass. Compile-time constant
/// with no config knob, like the original.
pub const LOADER_STARTUP_DELAY: Duration = Duration::from_secs(60);

/// Fallback between manager passes when no path suggests anything
/// sooner.
const MANAGER_MAX_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Helper processes keep a token connection budget.
const HELPER_CONNECTIONS: usize = 512;

pub fn cache_manager_process_cycle(cycle: &Cycle) -> ! {
    let mut ev = helper_init(cycle, "quay: cache mgr");
    ev.add_timer(TimerKey::CacheManager, Duration::ZERO);

    loop {
        if TERMINATE.load(std::sync::atomic::Ordering::Relaxed)
            || QUIT.load(std::sync::atomic::Ordering::Relaxed)
        {
            info!("exiting");
            std::process::exit(0);
        }
        if signals::take(&REOPEN) {
            info!("reopening logs");
            logfile::reopen_files(cycle, None);
        }

        for wakeup in ev.process_events_and_timers() {
            match wakeup {
                Wakeup::ChannelReady => worker::channel_handler(&mut ev),
                Wakeup::Timer(TimerKey::CacheManager) => {
                    let next = manager_pass(cycle);
                    ev.add_timer(TimerKey::CacheManager, next);
                }
                Wakeup::Timer(_) => {}
            }
        }
    }
}

pub fn cache_loader_process_cycle(cycle: &Cycle) -> ! {
    let mut ev = helper_init(cycle, "quay: cache ldr");
    ev.add_timer(TimerKey::CacheLoader, LOADER_STARTUP_DELAY);

    loop {
        if TERMINATE.load(std::sync::atomic::Ordering::Relaxed)
            || QUIT.load(std::sync::atomic::Ordering::Relaxed)
        {
            info!("exiting");
            std::process::exit(0);
        }
        if signals::take(&REOPEN) {
            info!("reopening logs");
            logfile::reopen_files(cycle, None);
        }

        for wakeup in ev.process_events_and_timers() {
            match wakeup {
                Wakeup::ChannelReady => worker::channel_handler(&mut ev),
                Wakeup::Timer(TimerKey::CacheLoader) => {
                    loader_pass(cycle);
                    info!("exiting");
                    std::process::exit(0);
                }
                Wakeup::Timer(_) => {}
            }
        }
    }
}

fn helper_init(cycle: &Cycle, title: &str) -> EventLoop {
    process::set_role(Role::Helper);

    // Helpers never accept; close the inherited listener descriptors
    // before anything else so they hold no accept-side state.
    worker::close_listening_sockets(cycle);

    worker::worker_process_init(cycle, -1);
    process::set_title(title);

    let mut ev = EventLoop::without_listeners(cycle, HELPER_CONNECTIONS);
    ev.set_channel(CHANNEL_FD.load(std::sync::atomic::Ordering::Relaxed));
    ev
}

/// One manager pass over every managed path. Returns the delay until the
/// next pass: the smallest per-path suggestion, floored at 1 ms.
pub fn manager_pass(cycle: &Cycle) -> Duration {
    let mut next = MANAGER_MAX_INTERVAL;

    for path in cycle.cache_paths.iter().filter(|p| p.manager) {
        let suggested = manage_path(path);
        next = next.min(suggested);
        quay_core::clock::update();
    }

    next.max(Duration::from_millis(1))
}

/// Prune entries older than the path's inactivity window. The suggested
/// next-pass delay is the path's configured interval.
fn manage_path(cache: &CachePath) -> Duration {
    let cutoff = SystemTime::now() - cache.inactive;
    let mut removed = 0u64;
    prune_dir(&cache.path, cutoff, &mut removed);
    if removed > 0 {
        info!(path = %cache.path.display(), removed, "cache manager pass");
    } else {
        debug!(path = %cache.path.display(), "cache manager pass, nothing expired");
    }
    cache.interval
}

fn prune_dir(dir: &Path, cutoff: SystemTime, removed: &mut u64) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %dir.display(), "cache manager cannot read directory: {e}");
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else { continue };
        if file_type.is_dir() {
            prune_dir(&path, cutoff, removed);
            continue;
        }
        let expired = entry
            .metadata()
            .and_then(|m| m.modified())
            .map(|mtime| mtime < cutoff)
            .unwrap_or(false);
        if expired {
            match std::fs::remove_file(&path) {
                Ok(()) => *removed += 1,
                Err(e) => warn!(path = %path.display(), "cache manager remove failed: {e}"),
            }
        }
    }
}

/// The loader's single pass: walk every loader path to completion,
/// bailing out between paths if shutdown was requested.
pub fn loader_pass(cycle: &Cycle) {
    for path in &cycle.cache_paths {
        if TERMINATE.load(std::sync::atomic::Ordering::Relaxed)
            || QUIT.load(std::sync::atomic::Ordering::Relaxed)
        {
            break;
        }
        if !path.loader {
            continue;
        }

        let mut files = 0u64;
        let mut bytes = 0u64;
        walk_dir(&path.path, &mut files, &mut bytes);
        info!(path = %path.path.display(), files, bytes, "cache loader finished");
        quay_core::clock::update();
    }
}

fn walk_dir(dir: &Path, files: &mut u64, bytes: &mut u64) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %dir.display(), "cache loader cannot read directory: {e}");
            return;
        }
    };

    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else { continue };
        if file_type.is_dir() {
            walk_dir(&entry.path(), files, bytes);
        } else {
            *files += 1;
            *bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
}

#[cfg(test)]
#[path = "cache_tests.rs"]
mod tests;
