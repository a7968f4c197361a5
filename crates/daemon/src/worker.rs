// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker lifecycle: post-fork init, the serving loop, the channel
//! handler, and exit.

use std::ffi::CString;
use std::sync::atomic::Ordering;
use std::time::Duration;

use nix::sys::resource::{setrlimit, Resource};
use nix::unistd::{chdir, getpid, initgroups, setgid, setuid, Gid, Group, Uid, User};
use quay_core::channel::{self, ChannelError, Command};
use quay_core::{affinity, clock, os, WorkerAffinity};
use tracing::{debug, error, info, warn};

use crate::cycle::Cycle;
use crate::event::{EventLoop, TimerKey, Wakeup};
use crate::module::modules;
use crate::process::{self, Role, CHANNEL_FD, PROCESS_SLOT, PROCESS_TABLE};
use crate::signals::{self, QUIT, REOPEN, TERMINATE};
use crate::{environment, logfile};

/// Per-worker connection budget.
const WORKER_CONNECTIONS: usize = 512;

/// The worker entry point; never returns.
pub fn worker_process_cycle(cycle: &Cycle, worker: i64) -> ! {
    process::set_role(Role::Worker);

    worker_process_init(cycle, worker);
    process::set_title("quay: worker");

    let mut ev = EventLoop::new(cycle, WORKER_CONNECTIONS);
    ev.set_channel(CHANNEL_FD.load(Ordering::Relaxed));

    let mut exiting = false;

    loop {
        if exiting && ev.no_timers_left() {
            info!("exiting");
            worker_process_exit(cycle, &ev, exiting);
        }

        debug!("worker cycle");
        for wakeup in ev.process_events_and_timers() {
            match wakeup {
                Wakeup::ChannelReady => channel_handler(&mut ev),
                Wakeup::Timer(TimerKey::Shutdown) => {
                    warn!("graceful shutdown timed out, closing lingering connections");
                    ev.close_all_connections();
                }
                Wakeup::Timer(_) => {}
            }
        }

        if TERMINATE.load(Ordering::Relaxed) {
            info!("exiting");
            worker_process_exit(cycle, &ev, exiting);
        }

        if signals::take(&QUIT) {
            if !exiting {
                exiting = true;
                info!("gracefully shutting down");
                process::set_title("quay: worker (x)");

                if cycle.config.shutdown_timeout > 0 {
                    ev.add_timer(
                        TimerKey::Shutdown,
                        Duration::from_millis(cycle.config.shutdown_timeout),
                    );
                }
                ev.close_listeners();
                close_listening_sockets(cycle);
                ev.close_idle_connections();
                ev.flush_pending();
            }
        }

        if signals::take(&REOPEN) {
            info!("reopening logs");
            logfile::reopen_files(cycle, None);
        }
    }
}

/// Post-fork initialization shared by workers (index >= 0) and cache
/// helpers (index -1, no affinity, no priority). Fatal problems exit(2);
/// the master respawns.
pub fn worker_process_init(cycle: &Cycle, worker: i64) {
    let config = &cycle.config;

    // 1. The child sees exactly the configured environment.
    environment::apply(&cycle.env);

    // 2. Nice value, workers only.
    if worker >= 0 && config.priority != 0 {
        let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, config.priority) };
        if rc == -1 {
            error!(priority = config.priority, "setpriority failed: {}", last_errno());
        }
    }

    // 3. Descriptor and core limits.
    if let Some(limit) = config.worker_rlimit_nofile {
        if let Err(e) = setrlimit(Resource::RLIMIT_NOFILE, limit, limit) {
            error!(limit, "setrlimit(RLIMIT_NOFILE) failed: {e}");
        }
    }
    if let Some(limit) = config.worker_rlimit_core {
        if let Err(e) = setrlimit(Resource::RLIMIT_CORE, limit, limit) {
            error!(limit, "setrlimit(RLIMIT_CORE) failed: {e}");
        }
    }

    // 4. Privilege drop when the master runs as root.
    if Uid::effective().is_root() {
        if let Some(user) = config.user.as_deref() {
            drop_privileges(user, config.group.as_deref(), config.transparent);
        }
    }

    // 5. CPU affinity, workers only.
    if worker >= 0 {
        match WorkerAffinity::parse(&config.worker_cpu_affinity, os::ncpu()) {
            Ok(Some(masks)) => {
                if let Some(mask) = masks.mask_for(worker as usize) {
                    if let Err(e) = affinity::apply(&mask) {
                        error!(worker, "sched_setaffinity failed: {e}");
                    }
                }
            }
            Ok(None) => {}
            // Validated at config load; a failure here means the CPU
            // count changed under us.
            Err(e) => error!("cpu affinity unusable: {e}"),
        }
    }

    // 6. Re-enable core dumps after the uid change.
    let rc = unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 1, 0, 0, 0) };
    if rc == -1 {
        error!("prctl(PR_SET_DUMPABLE) failed: {}", last_errno());
    }

    // 7. Working directory.
    if let Some(dir) = &config.working_directory {
        if let Err(e) = chdir(dir.as_path()) {
            error!(dir = %dir.display(), "chdir failed: {e}");
            std::process::exit(2);
        }
    }

    // 8. The master's blocked mask must not leak into the child.
    if let Err(e) = signals::unblock_all() {
        error!("sigprocmask failed: {e}");
    }

    // 9. Reseed the PRNG so siblings diverge.
    let (sec, msec) = clock::now_parts();
    os::srand(((getpid().as_raw() as u64) << 16) ^ sec ^ u64::from(msec));

    // 10. Module hooks; any failure is fatal for this child.
    for module in modules() {
        if let Some(hook) = module.init_process {
            if let Err(e) = hook(cycle) {
                error!("init_process failed: {e}");
                std::process::exit(2);
            }
        }
    }

    // 11. Channel hygiene: keep our own child end and every sibling's
    // master end (OPEN_CHANNEL installs future ones); close the sibling
    // child ends and our own master end that fork duplicated into us.
    let own_slot = PROCESS_SLOT.load(Ordering::Relaxed);
    let mut table = PROCESS_TABLE.lock();
    for (index, slot) in table.iter_mut() {
        if slot.pid == -1 || index == own_slot || slot.channel[1] == -1 {
            continue;
        }
        if let Err(e) = nix::unistd::close(slot.channel[1]) {
            error!("close() sibling channel failed: {e}");
        }
        slot.channel[1] = -1;
    }
    let own = table.slot_mut(own_slot);
    if own.channel[0] != -1 {
        if let Err(e) = nix::unistd::close(own.channel[0]) {
            error!("close() channel failed: {e}");
        }
        own.channel[0] = -1;
    }
}

fn drop_privileges(user: &str, group: Option<&str>, transparent: bool) {
    let pwd = match User::from_name(user) {
        Ok(Some(pwd)) => pwd,
        Ok(None) => {
            error!(user, "unknown user");
            std::process::exit(2);
        }
        Err(e) => {
            error!(user, "getpwnam failed: {e}");
            std::process::exit(2);
        }
    };

    let gid: Gid = match group {
        Some(name) => match Group::from_name(name) {
            Ok(Some(grp)) => grp.gid,
            Ok(None) => {
                error!(group = name, "unknown group");
                std::process::exit(2);
            }
            Err(e) => {
                error!(group = name, "getgrnam failed: {e}");
                std::process::exit(2);
            }
        },
        None => pwd.gid,
    };

    if let Err(e) = setgid(gid) {
        error!(%gid, "setgid failed: {e}");
        std::process::exit(2);
    }

    let user_c = match CString::new(user) {
        Ok(c) => c,
        Err(_) => {
            error!(user, "user name contains NUL");
            std::process::exit(2);
        }
    };
    if let Err(e) = initgroups(&user_c, gid) {
        error!(user, "initgroups failed: {e}");
    }

    // Transparent proxying needs CAP_NET_RAW on the far side of setuid.
    if transparent {
        let rc = unsafe { libc::prctl(libc::PR_SET_KEEPCAPS, 1, 0, 0, 0) };
        if rc == -1 {
            error!("prctl(PR_SET_KEEPCAPS) failed: {}", last_errno());
            std::process::exit(2);
        }
    }

    if let Err(e) = setuid(pwd.uid) {
        error!(user, "setuid failed: {e}");
        std::process::exit(2);
    }

    if transparent {
        if let Err(e) = keep_net_raw_only() {
            error!("capset failed: {e}");
            std::process::exit(2);
        }
    }
}

fn last_errno() -> std::io::Error {
    std::io::Error::last_os_error()
}

// Reduce capabilities to CAP_NET_RAW after the uid change.
fn keep_net_raw_only() -> Result<(), std::io::Error> {
    const LINUX_CAPABILITY_VERSION_1: u32 = 0x1998_0330;
    const CAP_NET_RAW: u32 = 13;

    #[repr(C)]
    struct CapHeader {
        version: u32,
        pid: libc::c_int,
    }
    #[repr(C)]
    struct CapData {
        effective: u32,
        permitted: u32,
        inheritable: u32,
    }

    let header = CapHeader { version: LINUX_CAPABILITY_VERSION_1, pid: 0 };
    let data = CapData { effective: 1 << CAP_NET_RAW, permitted: 1 << CAP_NET_RAW, inheritable: 0 };

    let rc = unsafe { libc::syscall(libc::SYS_capset, &header, &data) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Close this process's copies of the listening descriptors by number.
/// Children leave through `process::exit`, which runs no destructors, so
/// the shared handles can never double-close what we close here.
pub fn close_listening_sockets(cycle: &Cycle) {
    for listener in &cycle.listeners {
        if let Some(fd) = listener.raw_fd() {
            let _ = nix::unistd::close(fd);
        }
    }
}

/// Drain the control channel: commands become flag stores, OPEN/CLOSE
/// maintain the sibling channel fds in the process table.
pub fn channel_handler(ev: &mut EventLoop) {
    let fd = CHANNEL_FD.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }

    loop {
        match channel::read_channel(fd) {
            Ok(Some(msg)) => {
                debug!(command = ?msg.command, "channel command");
                match msg.command {
                    Command::Quit => QUIT.store(true, Ordering::Relaxed),
                    Command::Terminate => TERMINATE.store(true, Ordering::Relaxed),
                    Command::Reopen => REOPEN.store(true, Ordering::Relaxed),
                    Command::OpenChannel => {
                        debug!(slot = msg.slot, pid = msg.pid, fd = msg.fd, "get channel");
                        let mut table = PROCESS_TABLE.lock();
                        let idx = msg.slot.max(0) as usize;
                        table.ensure(idx);
                        let slot = table.slot_mut(idx);
                        slot.pid = msg.pid;
                        slot.channel[0] = msg.fd;
                    }
                    Command::CloseChannel => {
                        let mut table = PROCESS_TABLE.lock();
                        let idx = msg.slot.max(0) as usize;
                        table.ensure(idx);
                        let slot = table.slot_mut(idx);
                        debug!(slot = msg.slot, pid = msg.pid, fd = slot.channel[0], "close channel");
                        if slot.channel[0] != -1 {
                            if let Err(e) = nix::unistd::close(slot.channel[0]) {
                                error!("close() channel failed: {e}");
                            }
                            slot.channel[0] = -1;
                        }
                        slot.pid = -1;
                    }
                }
            }
            Ok(None) => return,
            Err(ChannelError::Closed) => {
                // Master is gone. Keep serving; there is nobody left to
                // tell us otherwise.
                warn!("control channel closed");
                ev.clear_channel();
                return;
            }
            Err(e) => {
                error!("channel read failed: {e}");
                ev.clear_channel();
                return;
            }
        }
    }
}

/// Worker exit: module hooks, leak diagnostics on graceful shutdown, then
/// a hard exit (no destructors; shared descriptors are the parent's
/// problem).
pub fn worker_process_exit(cycle: &Cycle, ev: &EventLoop, exiting: bool) -> ! {
    for module in modules() {
        if let Some(hook) = module.exit_process {
            hook(cycle);
        }
    }

    if exiting && !TERMINATE.load(Ordering::Relaxed) {
        let open = ev.open_connections();
        if !open.is_empty() {
            for (id, fd) in &open {
                error!(conn = *id, fd = *fd, "open socket left in connection at exit");
            }
            signals::debug_point(cycle.config.debug_points);
        }
    }

    std::process::exit(0);
}
