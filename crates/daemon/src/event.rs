// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Minimal poll(2) event loop.
//!
//! The request pipeline is not the supervisor's business; what the
//! lifecycle needs from the event layer is exactly
//! `process_events_and_timers` and `no_timers_left`, plus the ability to
//! stop accepting and shed idle connections during graceful shutdown.
//! The stream service itself is a line echo: enough to keep real
//! connections open across reloads and upgrades.
//!
//! Signals interrupt `poll` (the handlers are installed without
//! SA_RESTART); the caller re-checks its flags after every pass.

use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{accept4, SockFlag};
use nix::unistd::{read, write};
use quay_core::clock;
use tracing::{debug, error, warn};

use crate::cycle::Cycle;
use crate::logfile::AccessLog;

/// Timers the lifecycle arms; one slot per purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKey {
    /// Graceful-shutdown deadline: close whatever is still open.
    Shutdown,
    /// Next cache-manager pass.
    CacheManager,
    /// Cache-loader start delay.
    CacheLoader,
}

/// What a `process_events_and_timers` pass wants the caller to handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    /// The control channel is readable.
    ChannelReady,
    Timer(TimerKey),
}

struct LoopListener {
    fd: Arc<OwnedFd>,
}

struct Connection {
    id: u64,
    fd: OwnedFd,
    peer: String,
    /// Bytes echoed but not yet written out.
    pending: Vec<u8>,
    bytes_in: u64,
    bytes_out: u64,
}

impl Connection {
    // A connection that never carried data is idle; one mid-stream is a
    // live session and drains on its own schedule.
    fn idle(&self) -> bool {
        self.bytes_in == 0 && self.pending.is_empty()
    }
}

pub struct EventLoop {
    listeners: Vec<LoopListener>,
    channel_fd: Option<RawFd>,
    connections: Vec<Connection>,
    timers: Vec<(TimerKey, Instant)>,
    accepting: bool,
    connection_limit: usize,
    access_log: Option<AccessLog>,
    /// Upper bound on a poll sleep, from `timer_resolution`.
    timer_resolution: Option<Duration>,
    next_id: u64,
}

impl EventLoop {
    /// Event loop over the cycle's listeners.
    pub fn new(cycle: &Cycle, connection_limit: usize) -> Self {
        let listeners = cycle
            .listeners
            .iter()
            .filter(|l| !l.ignore)
            .filter_map(|l| l.fd.clone())
            .map(|fd| LoopListener { fd })
            .collect();
        Self::build(cycle, listeners, connection_limit)
    }

    /// Helper-process variant: no listeners, timers and channel only.
    pub fn without_listeners(cycle: &Cycle, connection_limit: usize) -> Self {
        Self::build(cycle, Vec::new(), connection_limit)
    }

    fn build(cycle: &Cycle, listeners: Vec<LoopListener>, connection_limit: usize) -> Self {
        let timer_resolution = match cycle.config.timer_resolution {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        Self {
            listeners,
            channel_fd: None,
            connections: Vec::new(),
            timers: Vec::new(),
            accepting: true,
            connection_limit,
            access_log: cycle.access_log.clone(),
            timer_resolution,
            next_id: 1,
        }
    }

    /// Register the worker's channel end for readability wakeups.
    pub fn set_channel(&mut self, fd: RawFd) {
        self.channel_fd = (fd >= 0).then_some(fd);
    }

    /// Forget the channel (master died; the worker soldiers on).
    pub fn clear_channel(&mut self) {
        self.channel_fd = None;
    }

    /// Arm (or re-arm) a timer.
    pub fn add_timer(&mut self, key: TimerKey, delay: Duration) {
        let deadline = Instant::now() + delay;
        if let Some(slot) = self.timers.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = deadline;
        } else {
            self.timers.push((key, deadline));
        }
    }

    /// "No timers left": nothing pending at the event layer, neither
    /// timers nor live connections. The exiting worker leaves when this
    /// turns true.
    pub fn no_timers_left(&self) -> bool {
        self.timers.is_empty() && self.connections.is_empty()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Stop accepting and drop the listener descriptors.
    pub fn close_listeners(&mut self) {
        self.accepting = false;
        self.listeners.clear();
    }

    /// Close connections with nothing in flight (graceful shutdown).
    pub fn close_idle_connections(&mut self) {
        let mut index = 0;
        while index < self.connections.len() {
            if self.connections[index].idle() {
                let conn = self.connections.swap_remove(index);
                self.log_close(&conn);
            } else {
                index += 1;
            }
        }
    }

    /// Close everything (shutdown timeout fired, or fast terminate).
    pub fn close_all_connections(&mut self) {
        for conn in self.connections.drain(..) {
            if let Some(access) = &self.access_log {
                access.write_line(&format!(
                    "{} {} in={} out={} aborted",
                    clock::now_ms(),
                    conn.peer,
                    conn.bytes_in,
                    conn.bytes_out
                ));
            }
        }
    }

    /// Connections still open at worker exit; with a graceful shutdown in
    /// progress these are leaks worth shouting about.
    pub fn open_connections(&self) -> Vec<(u64, RawFd)> {
        self.connections.iter().map(|c| (c.id, c.fd.as_raw_fd())).collect()
    }

    /// One pass: wait for readiness or the next timer, serve socket work
    /// internally, and report channel/timer wakeups for the caller.
    pub fn process_events_and_timers(&mut self) -> Vec<Wakeup> {
        let mut wakeups = Vec::new();

        let accepting_now = self.accepting && self.connections.len() < self.connection_limit;

        // Readiness list layout: [listeners..][channel][connections..]
        let mut fds: Vec<PollFd> = Vec::new();
        if accepting_now {
            for listener in &self.listeners {
                fds.push(PollFd::new(listener.fd.as_fd(), PollFlags::POLLIN));
            }
        }
        let listener_count = fds.len();
        if let Some(fd) = self.channel_fd {
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            fds.push(PollFd::new(borrowed, PollFlags::POLLIN));
        }
        let channel_index = self.channel_fd.map(|_| listener_count);
        let conn_base = fds.len();
        for conn in &self.connections {
            let mut interest = PollFlags::POLLIN;
            if !conn.pending.is_empty() {
                interest |= PollFlags::POLLOUT;
            }
            fds.push(PollFd::new(conn.fd.as_fd(), interest));
        }

        match poll(&mut fds, self.poll_timeout()) {
            Ok(_) => {}
            Err(Errno::EINTR) => {
                // A signal interrupted the wait; the caller's flag checks
                // are the point of waking up.
                clock::update();
                return wakeups;
            }
            Err(e) => {
                error!("poll failed: {e}");
                clock::update();
                return wakeups;
            }
        }

        let mut accept_ready = Vec::new();
        let mut conn_ready = Vec::new();
        for (index, fd) in fds.iter().enumerate() {
            let revents = fd.revents().unwrap_or(PollFlags::empty());
            if revents.is_empty() {
                continue;
            }
            if index < listener_count {
                accept_ready.push(index);
            } else if Some(index) == channel_index {
                wakeups.push(Wakeup::ChannelReady);
            } else {
                conn_ready.push((index - conn_base, revents));
            }
        }
        drop(fds);

        clock::update();

        for (key, _) in self.due_timers() {
            wakeups.push(Wakeup::Timer(key));
        }

        for listener_index in accept_ready {
            self.accept_pending(listener_index);
        }

        // Highest index first so swap_remove cannot disturb pending ones.
        conn_ready.sort_by(|a, b| b.0.cmp(&a.0));
        for (conn_index, revents) in conn_ready {
            self.serve_connection(conn_index, revents);
        }

        wakeups
    }

    /// One write attempt for every connection with queued output, used
    /// when shutdown starts instead of waiting for POLLOUT.
    pub fn flush_pending(&mut self) {
        for index in (0..self.connections.len()).rev() {
            if !self.connections[index].pending.is_empty() {
                self.write_pending(index);
            }
        }
    }

    fn poll_timeout(&self) -> PollTimeout {
        let now = Instant::now();
        let until_timer = self
            .timers
            .iter()
            .map(|(_, deadline)| deadline.saturating_duration_since(now))
            .min();

        let wait = match (until_timer, self.timer_resolution) {
            (Some(t), Some(r)) => Some(t.min(r)),
            (Some(t), None) => Some(t),
            (None, r) => r,
        };

        match wait {
            // Cap each sleep; an early wakeup just polls again.
            Some(d) => PollTimeout::from(d.as_millis().min(u64::from(u16::MAX) as u128) as u16),
            None => PollTimeout::NONE,
        }
    }

    fn due_timers(&mut self) -> Vec<(TimerKey, Instant)> {
        let now = Instant::now();
        let mut due = Vec::new();
        let mut index = 0;
        while index < self.timers.len() {
            if self.timers[index].1 <= now {
                due.push(self.timers.swap_remove(index));
            } else {
                index += 1;
            }
        }
        due
    }

    fn accept_pending(&mut self, listener_index: usize) {
        loop {
            if self.connections.len() >= self.connection_limit {
                warn!(limit = self.connection_limit, "connection limit reached, deferring accept");
                return;
            }
            let Some(listener) = self.listeners.get(listener_index) else { return };
            match accept4(
                listener.fd.as_raw_fd(),
                SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            ) {
                Ok(fd) => {
                    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
                    let peer = peer_name(fd.as_raw_fd());
                    let id = self.next_id;
                    self.next_id += 1;
                    debug!(conn = id, %peer, "accepted connection");
                    self.connections.push(Connection {
                        id,
                        fd,
                        peer,
                        pending: Vec::new(),
                        bytes_in: 0,
                        bytes_out: 0,
                    });
                }
                Err(Errno::EAGAIN) => return,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECONNABORTED) => continue,
                Err(e) => {
                    error!("accept failed: {e}");
                    return;
                }
            }
        }
    }

    fn serve_connection(&mut self, index: usize, revents: PollFlags) {
        if revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
            self.close_connection(index);
            return;
        }

        if revents.contains(PollFlags::POLLIN) {
            let mut buf = [0u8; 4096];
            loop {
                let fd = self.connections[index].fd.as_raw_fd();
                match read(fd, &mut buf) {
                    Ok(0) => {
                        self.close_connection(index);
                        return;
                    }
                    Ok(n) => {
                        let conn = &mut self.connections[index];
                        conn.bytes_in += n as u64;
                        conn.pending.extend_from_slice(&buf[..n]);
                    }
                    Err(Errno::EAGAIN) => break,
                    Err(Errno::EINTR) => continue,
                    Err(_) => {
                        self.close_connection(index);
                        return;
                    }
                }
            }
        }

        if !self.connections[index].pending.is_empty() {
            self.write_pending(index);
        } else if revents.contains(PollFlags::POLLHUP) {
            self.close_connection(index);
        }
    }

    fn write_pending(&mut self, index: usize) {
        loop {
            let conn = &mut self.connections[index];
            if conn.pending.is_empty() {
                return;
            }
            match write(conn.fd.as_fd(), &conn.pending) {
                Ok(n) => {
                    conn.bytes_out += n as u64;
                    conn.pending.drain(..n);
                }
                Err(Errno::EAGAIN) => return,
                Err(Errno::EINTR) => continue,
                Err(_) => {
                    self.close_connection(index);
                    return;
                }
            }
        }
    }

    fn close_connection(&mut self, index: usize) {
        let conn = self.connections.swap_remove(index);
        self.log_close(&conn);
    }

    fn log_close(&self, conn: &Connection) {
        debug!(conn = conn.id, peer = %conn.peer, "connection closed");
        if let Some(access) = &self.access_log {
            access.write_line(&format!(
                "{} {} in={} out={}",
                clock::now_ms(),
                conn.peer,
                conn.bytes_in,
                conn.bytes_out
            ));
        }
    }
}

fn peer_name(fd: RawFd) -> String {
    use nix::sys::socket::{getpeername, SockaddrStorage};
    match getpeername::<SockaddrStorage>(fd) {
        Ok(addr) => addr.to_string(),
        Err(_) => "-".to_string(),
    }
}

#[cfg(test)]
#[path = "event_tests.rs"]
mod tests;
