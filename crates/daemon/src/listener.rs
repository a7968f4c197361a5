// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Listening sockets.
//!
//! Listeners are bound by the master (or adopted from a predecessor
//! binary via the environment) and inherited by workers through fork;
//! workers never bind. Descriptors are deliberately not close-on-exec so
//! a successor binary inherits them across exec.

use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::socket::{
    bind, getsockname, getsockopt, listen, setsockopt, socket, sockopt, AddressFamily, Backlog,
    SockFlag, SockType, SockaddrIn, SockaddrIn6, SockaddrStorage,
};
use quay_conf::ListenConf;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("socket() for {addr} failed: {source}")]
    Socket {
        addr: SocketAddr,
        #[source]
        source: Errno,
    },

    #[error("bind() to {addr} failed: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: Errno,
    },

    #[error("listen() on {addr} failed: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: Errno,
    },

    #[error("invalid backlog {0}")]
    Backlog(i32),

    #[error("invalid descriptor number {0:?} in the inherited listener list")]
    InvalidFdList(String),

    #[error("inherited descriptor {fd} is not an inet listener: {source}")]
    NotInet {
        fd: RawFd,
        #[source]
        source: Errno,
    },
}

/// One bound socket owned by a cycle.
#[derive(Debug, Clone)]
pub struct Listener {
    /// Shared so a reload can carry the descriptor into the next cycle
    /// without a dup/close pair; `None` after the owning process closed
    /// its copy.
    pub fd: Option<Arc<OwnedFd>>,
    pub addr: SocketAddr,
    /// Adopted from a predecessor binary via the environment.
    pub inherited: bool,
    /// Superseded by a newer cycle; skipped by the fd handoff.
    pub ignore: bool,
    pub reuseport: bool,
    pub backlog: i32,
}

impl Listener {
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|fd| fd.as_raw_fd())
    }

    pub fn close(&mut self) {
        self.fd = None;
    }
}

/// Bind and listen per one `[[listen]]` entry.
pub fn open(conf: &ListenConf) -> Result<Listener, ListenerError> {
    let family =
        if conf.addr.is_ipv4() { AddressFamily::Inet } else { AddressFamily::Inet6 };

    // Non-blocking for the workers' accept loop; never close-on-exec (see
    // module docs).
    let fd = socket(family, SockType::Stream, SockFlag::SOCK_NONBLOCK, None)
        .map_err(|source| ListenerError::Socket { addr: conf.addr, source })?;

    let sockopt_err = |source| ListenerError::Socket { addr: conf.addr, source };
    setsockopt(&fd, sockopt::ReuseAddr, &true).map_err(sockopt_err)?;
    if conf.reuseport {
        setsockopt(&fd, sockopt::ReusePort, &true).map_err(sockopt_err)?;
    }

    match conf.addr {
        SocketAddr::V4(v4) => bind(fd.as_raw_fd(), &SockaddrIn::from(v4)),
        SocketAddr::V6(v6) => bind(fd.as_raw_fd(), &SockaddrIn6::from(v6)),
    }
    .map_err(|source| ListenerError::Bind { addr: conf.addr, source })?;

    let backlog = Backlog::new(conf.backlog).map_err(|_| ListenerError::Backlog(conf.backlog))?;
    listen(&fd, backlog).map_err(|source| ListenerError::Listen { addr: conf.addr, source })?;

    Ok(Listener {
        fd: Some(Arc::new(fd)),
        addr: conf.addr,
        inherited: false,
        ignore: false,
        reuseport: conf.reuseport,
        backlog: conf.backlog,
    })
}

/// Parse the inherited-descriptor environment value. Semicolons are what
/// we emit; colons are accepted too.
pub fn parse_inherited(value: &str) -> Result<Vec<RawFd>, ListenerError> {
    let mut fds = Vec::new();
    for part in value.split([';', ':']) {
        if part.is_empty() {
            continue;
        }
        let fd: RawFd = part
            .parse()
            .ok()
            .filter(|fd| *fd >= 0)
            .ok_or_else(|| ListenerError::InvalidFdList(part.to_string()))?;
        fds.push(fd);
    }
    Ok(fds)
}

/// Recover Listener records from descriptors a predecessor binary left in
/// the environment. The bind address and options are read back from the
/// socket itself; the normal bind path is skipped for these.
pub fn inherit(value: &str) -> Result<Vec<Listener>, ListenerError> {
    let mut listeners = Vec::new();
    for fd in parse_inherited(value)? {
        match listener_from_fd(fd) {
            Ok(listener) => listeners.push(listener),
            Err(e) => {
                // A stray descriptor is not worth refusing startup over.
                warn!("ignoring inherited descriptor {fd}: {e}");
                let _ = nix::unistd::close(fd);
            }
        }
    }
    Ok(listeners)
}

fn listener_from_fd(fd: RawFd) -> Result<Listener, ListenerError> {
    let storage: SockaddrStorage =
        getsockname(fd).map_err(|source| ListenerError::NotInet { fd, source })?;

    let addr = if let Some(sin) = storage.as_sockaddr_in() {
        SocketAddr::V4(SocketAddrV4::new(sin.ip().into(), sin.port()))
    } else if let Some(sin6) = storage.as_sockaddr_in6() {
        SocketAddr::V6(SocketAddrV6::new(
            sin6.ip(),
            sin6.port(),
            sin6.flowinfo(),
            sin6.scope_id(),
        ))
    } else {
        return Err(ListenerError::NotInet { fd, source: Errno::EAFNOSUPPORT });
    };

    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    let reuseport = getsockopt(&owned, sockopt::ReusePort).unwrap_or(false);

    Ok(Listener {
        fd: Some(Arc::new(owned)),
        addr,
        inherited: true,
        ignore: false,
        reuseport,
        backlog: 0,
    })
}

#[cfg(test)]
#[path = "listener_tests.rs"]
mod tests;
