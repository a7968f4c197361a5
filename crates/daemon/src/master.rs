// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The master supervisor.
//!
//! A signal-driven state machine: every interesting signal is blocked
//! outside of `sigsuspend`, handlers only set flags, and the loop body
//! reacts to whatever flags are up after each wakeup. The master serves
//! no traffic; it spawns workers, reaps and respawns them, coordinates
//! reload and binary upgrade, and escalates a fast shutdown from
//! TERMINATE rounds to SIGKILL on a doubling timer.

use std::ffi::OsString;
use std::sync::atomic::Ordering;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use quay_core::clock;
use tracing::{debug, error, info, warn};

use crate::cycle::{self, Cycle};
use crate::event::{EventLoop, Wakeup};
use crate::module::modules;
use crate::pid::PidFile;
use crate::process::{self, ChildKind, Disposition, Role, PROCESS_TABLE};
use crate::signals::{
    self, CHANGE_BINARY, NOACCEPT, QUIT, REAP, RECONFIGURE, REOPEN, SIGALRM, TERMINATE,
};
use crate::{logfile, spawn, upgrade};

/// First TERMINATE escalation delay; doubles each round, SIGKILL past
/// 1000 ms.
const TERMINATION_DELAY_MS: u64 = 50;

/// Settle time between starting the new generation and telling the old
/// one to drain. A grace period, not a synchronization primitive.
const RELOAD_SETTLE: Duration = Duration::from_millis(100);

/// Everything the master owns besides the process table.
pub struct Master {
    pub cycle: Cycle,
    pub pid_file: PidFile,
    /// Original argv, replayed verbatim by a binary upgrade.
    pub argv: Vec<OsString>,
}

pub fn master_process_cycle(mut master: Master) -> ! {
    process::set_role(Role::Master);
    process::set_title("quay: master");

    if let Err(e) = signals::block(&signals::master_sigmask()) {
        error!("sigprocmask failed: {e}");
    }

    let worker_count = master.cycle.config.worker_count(quay_core::os::ncpu());
    start_worker_processes(&master.cycle, worker_count, Disposition::Respawn);
    start_cache_manager_processes(&master.cycle, false);

    let mut new_binary: i32 = 0;
    let mut delay: u64 = 0;
    let mut sigio: u32 = 0;
    let mut live = true;
    let mut restart = false;
    let mut noaccepting = false;

    loop {
        if delay > 0 {
            if signals::take(&SIGALRM) {
                sigio = 0;
                delay *= 2;
            }
            debug!(delay, "termination cycle");
            arm_interval_timer(delay);
        }

        debug!("sigsuspend");
        signals::suspend();
        clock::update();

        if signals::take(&REAP) {
            debug!("reap children");
            live = reap_children(&mut master, &mut new_binary, &mut restart, &mut noaccepting);
        }

        if !live && (TERMINATE.load(Ordering::Relaxed) || QUIT.load(Ordering::Relaxed)) {
            master_process_exit(master);
        }

        if TERMINATE.load(Ordering::Relaxed) {
            if delay == 0 {
                delay = TERMINATION_DELAY_MS;
            }
            if sigio > 0 {
                sigio -= 1;
                continue;
            }
            sigio = master.cycle.config.worker_count(quay_core::os::ncpu()) + 2;

            if delay > 1000 {
                spawn::signal_worker_processes(Signal::SIGKILL);
            } else {
                spawn::signal_worker_processes(Signal::SIGTERM);
            }
            continue;
        }

        if QUIT.load(Ordering::Relaxed) {
            spawn::signal_worker_processes(Signal::SIGQUIT);
            master.cycle.close_listeners();
            continue;
        }

        if signals::take(&RECONFIGURE) {
            if new_binary > 0 {
                // An upgrade is in flight: SIGHUP means "give the old
                // binary a fresh worker set", not "reparse".
                let count = master.cycle.config.worker_count(quay_core::os::ncpu());
                start_worker_processes(&master.cycle, count, Disposition::Respawn);
                start_cache_manager_processes(&master.cycle, false);
                noaccepting = false;
                continue;
            }

            info!("reconfiguring");
            match Cycle::reload(&master.cycle) {
                Err(e) => {
                    error!("reload failed, keeping the running configuration: {e}");
                }
                Ok(fresh) => {
                    let old = std::mem::replace(&mut master.cycle, fresh);
                    if let Err(e) = master.cycle.install_error_log() {
                        error!("switching error log failed: {e}");
                    }
                    let count = master.cycle.config.worker_count(quay_core::os::ncpu());
                    start_worker_processes(&master.cycle, count, Disposition::JustRespawn);
                    start_cache_manager_processes(&master.cycle, true);

                    // Let the new set install its channels before the old
                    // set starts dropping off.
                    std::thread::sleep(RELOAD_SETTLE);

                    live = true;
                    spawn::signal_worker_processes(Signal::SIGQUIT);
                    drop(old);
                }
            }
        }

        if restart {
            restart = false;
            let count = master.cycle.config.worker_count(quay_core::os::ncpu());
            start_worker_processes(&master.cycle, count, Disposition::Respawn);
            start_cache_manager_processes(&master.cycle, false);
            live = true;
        }

        if signals::take(&REOPEN) {
            info!("reopening logs");
            logfile::reopen_files(&master.cycle, cycle::log_owner(&master.cycle.config));
            spawn::signal_worker_processes(Signal::SIGUSR1);
        }

        if signals::take(&CHANGE_BINARY) {
            info!("changing binary");
            let oldbin = master.cycle.config.oldbin_path();
            match upgrade::exec_new_binary(
                &master.cycle,
                &master.argv,
                &mut master.pid_file,
                &oldbin,
            ) {
                Ok(pid) => new_binary = pid,
                Err(e) => error!("binary upgrade failed: {e}"),
            }
        }

        if signals::take(&NOACCEPT) {
            noaccepting = true;
            spawn::signal_worker_processes(Signal::SIGQUIT);
        }
    }
}

pub(crate) fn start_worker_processes(cycle: &Cycle, count: u32, disposition: Disposition) {
    info!("start worker processes");
    for index in 0..count {
        match spawn::spawn_process(
            cycle,
            ChildKind::Worker(i64::from(index)),
            "worker process",
            disposition,
            None,
        ) {
            Ok(slot) => spawn::pass_open_channel(slot),
            Err(e) => error!(worker = index, "could not spawn worker process: {e}"),
        }
    }
}

pub(crate) fn start_cache_manager_processes(cycle: &Cycle, respawn: bool) {
    if !cycle.cache_paths.iter().any(|p| p.manager) {
        return;
    }

    let disposition = if respawn { Disposition::JustRespawn } else { Disposition::Respawn };
    match spawn::spawn_process(
        cycle,
        ChildKind::CacheManager,
        "cache manager process",
        disposition,
        None,
    ) {
        Ok(slot) => spawn::pass_open_channel(slot),
        Err(e) => error!("could not spawn cache manager process: {e}"),
    }

    if !cycle.cache_paths.iter().any(|p| p.loader) {
        return;
    }

    let disposition = if respawn { Disposition::JustSpawn } else { Disposition::NoRespawn };
    match spawn::spawn_process(
        cycle,
        ChildKind::CacheLoader,
        "cache loader process",
        disposition,
        None,
    ) {
        Ok(slot) => spawn::pass_open_channel(slot),
        Err(e) => error!("could not spawn cache loader process: {e}"),
    }
}

/// The reap sweep. Collects exit statuses, closes dead channels and tells
/// the survivors, respawns where policy says so, detects an aborted
/// upgrade, and reclaims slots. Returns whether any supervised child
/// remains.
fn reap_children(
    master: &mut Master,
    new_binary: &mut i32,
    restart: &mut bool,
    noaccepting: &mut bool,
) -> bool {
    collect_exit_statuses();

    // Phase one, under the table lock: bookkeeping and broadcasts.
    let mut respawns: Vec<(usize, ChildKind, &'static str)> = Vec::new();
    let mut live = false;
    let mut aborted_upgrade = false;
    {
        let mut table = PROCESS_TABLE.lock();
        let mut close_broadcasts: Vec<(usize, i32)> = Vec::new();
        let mut released: Vec<usize> = Vec::new();

        for (index, slot) in table.iter_mut() {
            if slot.pid == -1 {
                continue;
            }
            debug!(
                slot = index,
                pid = slot.pid,
                exiting = slot.exiting,
                exited = slot.exited,
                detached = slot.detached,
                respawn = slot.respawn,
                "reap sweep"
            );

            if !slot.exited {
                if slot.exiting || !slot.detached {
                    live = true;
                }
                continue;
            }

            if !slot.detached {
                spawn::close_channel_fds(&mut slot.channel);
                close_broadcasts.push((index, slot.pid));
            }

            let wants_respawn = slot.respawn
                && !slot.exiting
                && !TERMINATE.load(Ordering::Relaxed)
                && !QUIT.load(Ordering::Relaxed);
            if wants_respawn {
                if let Some(kind) = slot.kind.clone() {
                    respawns.push((index, kind, slot.name));
                    continue;
                }
            }

            if slot.pid == *new_binary {
                aborted_upgrade = true;
                *new_binary = 0;
                if *noaccepting {
                    *restart = true;
                    *noaccepting = false;
                }
            }

            released.push(index);
        }

        for index in released {
            table.release(index);
        }
        drop(table);

        for (index, pid) in close_broadcasts {
            spawn::pass_close_channel(index, pid);
        }
    }

    if aborted_upgrade {
        // The successor died: move the PID file back where the world
        // expects it.
        let primary = master.cycle.config.pid.clone();
        let oldbin = master.cycle.config.oldbin_path();
        warn!(
            "the new binary process exited, renaming {} back to {}",
            oldbin.display(),
            primary.display()
        );
        if let Err(e) = master.pid_file.rename(&primary) {
            error!("renaming pid file back after aborted upgrade failed: {e}");
        }
    }

    // Phase two, lock released: respawn into the same slots.
    for (slot, kind, name) in respawns {
        match spawn::spawn_process(&master.cycle, kind, name, Disposition::Respawn, Some(slot)) {
            Ok(slot) => {
                spawn::pass_open_channel(slot);
                live = true;
            }
            Err(e) => error!(slot, "could not respawn {name}: {e}"),
        }
    }

    live
}

/// Drain `waitpid` and mark table slots exited; the non-blocking loop
/// here replaces status collection inside the SIGCHLD handler, which is
/// restricted to a single flag store.
fn collect_exit_statuses() {
    loop {
        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => {
                if code == 0 {
                    info!(pid = pid.as_raw(), "child exited");
                } else {
                    error!(pid = pid.as_raw(), code, "child exited with error");
                }
                mark_exited(pid.as_raw(), code);
            }
            Ok(WaitStatus::Signaled(pid, signal, core_dumped)) => {
                error!(
                    pid = pid.as_raw(),
                    signal = %signal,
                    core_dumped,
                    "child exited on signal"
                );
                mark_exited(pid.as_raw(), 128 + signal as i32);
            }
            Ok(WaitStatus::StillAlive) => break,
            Ok(_) => continue,
            Err(Errno::ECHILD) => break,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                error!("waitpid failed: {e}");
                break;
            }
        }
    }
}

fn mark_exited(pid: i32, status: i32) {
    let mut table = PROCESS_TABLE.lock();
    if table.mark_exited(pid, status).is_none() {
        debug!(pid, "reaped a child with no table slot");
    }
}

fn master_process_exit(master: Master) -> ! {
    let Master { mut cycle, pid_file, .. } = master;

    pid_file.delete();

    info!("exit");

    for module in modules() {
        if let Some(hook) = module.exit_master {
            hook(&cycle);
        }
    }

    cycle.close_listeners();
    drop(cycle);
    std::process::exit(0);
}

/// Foreground single-process mode (`master = false`): the event loop and
/// the signal flags share one process; reload and reopen work, fast and
/// graceful shutdown collapse into plain exit.
pub fn single_process_cycle(mut cycle: Cycle, pid_file: PidFile) -> ! {
    process::set_role(Role::Single);

    crate::environment::apply(&cycle.env);

    for module in modules() {
        if let Some(hook) = module.init_process {
            if let Err(e) = hook(&cycle) {
                error!("init_process failed: {e}");
                std::process::exit(2);
            }
        }
    }

    let mut ev = EventLoop::new(&cycle, 512);

    loop {
        debug!("single process cycle");
        for wakeup in ev.process_events_and_timers() {
            if let Wakeup::Timer(key) = wakeup {
                debug!(?key, "timer in single-process mode");
            }
        }

        if TERMINATE.load(Ordering::Relaxed) || QUIT.load(Ordering::Relaxed) {
            for module in modules() {
                if let Some(hook) = module.exit_process {
                    hook(&cycle);
                }
            }
            let master = Master { cycle, pid_file, argv: Vec::new() };
            master_process_exit(master);
        }

        if signals::take(&RECONFIGURE) {
            info!("reconfiguring");
            match Cycle::reload(&cycle) {
                Err(e) => error!("reload failed, keeping the running configuration: {e}"),
                Ok(fresh) => {
                    cycle = fresh;
                    if let Err(e) = cycle.install_error_log() {
                        error!("switching error log failed: {e}");
                    }
                    ev = EventLoop::new(&cycle, 512);
                }
            }
        }

        if signals::take(&REOPEN) {
            info!("reopening logs");
            logfile::reopen_files(&cycle, None);
        }
    }
}

fn arm_interval_timer(delay_ms: u64) {
    let timer = libc::itimerval {
        it_interval: libc::timeval { tv_sec: 0, tv_usec: 0 },
        it_value: libc::timeval {
            tv_sec: (delay_ms / 1000) as libc::time_t,
            tv_usec: ((delay_ms % 1000) * 1000) as libc::suseconds_t,
        },
    };
    let rc = unsafe { libc::setitimer(libc::ITIMER_REAL, &timer, std::ptr::null_mut()) };
    if rc == -1 {
        error!("setitimer failed: {}", std::io::Error::last_os_error());
    }
}
