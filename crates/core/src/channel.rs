// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Master/child control channel.
//!
//! Each child shares a non-blocking `AF_UNIX` stream socketpair with the
//! master. Commands travel as fixed 16-byte records in host byte order
//! (they never cross a machine boundary); `OpenChannel` additionally
//! carries the new sibling's channel descriptor as `SCM_RIGHTS` ancillary
//! data on the same send.

use std::io::{IoSlice, IoSliceMut};
use std::os::unix::io::RawFd;

use nix::cmsg_space;
use nix::errno::Errno;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use thiserror::Error;

/// Size of one encoded channel record.
pub const CHANNEL_MSG_SIZE: usize = 16;

/// Channel commands, mirrored by the signal set the master falls back to
/// when a channel write fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    /// Install the channel fd of a newly spawned sibling.
    OpenChannel = 1,
    /// A sibling exited; drop its channel fd.
    CloseChannel = 2,
    /// Begin graceful shutdown.
    Quit = 3,
    /// Stop immediately.
    Terminate = 4,
    /// Reopen log files.
    Reopen = 5,
}

impl Command {
    fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::OpenChannel),
            2 => Some(Self::CloseChannel),
            3 => Some(Self::Quit),
            4 => Some(Self::Terminate),
            5 => Some(Self::Reopen),
            _ => None,
        }
    }
}

/// One control record. `fd` is -1 unless the command carries a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelMsg {
    pub command: Command,
    /// Pid of the process the record is about (not the sender's pid for
    /// close records).
    pub pid: i32,
    /// Process-table slot the record is about.
    pub slot: i32,
    pub fd: RawFd,
}

impl ChannelMsg {
    pub fn new(command: Command, pid: i32, slot: i32, fd: RawFd) -> Self {
        Self { command, pid, slot, fd }
    }

    pub fn encode(&self) -> [u8; CHANNEL_MSG_SIZE] {
        let mut buf = [0u8; CHANNEL_MSG_SIZE];
        buf[0..4].copy_from_slice(&(self.command as u32).to_ne_bytes());
        buf[4..8].copy_from_slice(&self.pid.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.slot.to_ne_bytes());
        buf[12..16].copy_from_slice(&self.fd.to_ne_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ChannelError> {
        if buf.len() < CHANNEL_MSG_SIZE {
            return Err(ChannelError::Truncated(buf.len()));
        }
        let raw = u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let command = Command::from_u32(raw).ok_or(ChannelError::UnknownCommand(raw))?;
        Ok(Self {
            command,
            pid: i32::from_ne_bytes([buf[4], buf[5], buf[6], buf[7]]),
            slot: i32::from_ne_bytes([buf[8], buf[9], buf[10], buf[11]]),
            fd: i32::from_ne_bytes([buf[12], buf[13], buf[14], buf[15]]),
        })
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel closed by peer")]
    Closed,

    #[error("short channel record: {0} bytes")]
    Truncated(usize),

    #[error("unknown channel command: {0}")]
    UnknownCommand(u32),

    #[error("channel i/o failed: {0}")]
    Sys(#[from] Errno),
}

/// Write one record to a channel fd. The descriptor in `msg.fd` rides as
/// ancillary data for `OpenChannel`; for every other command the fd field
/// is payload only.
///
/// Returns `Ok(false)` when the socket buffer is full (EAGAIN) so the
/// caller can fall back to a plain signal.
pub fn write_channel(fd: RawFd, msg: &ChannelMsg) -> Result<bool, ChannelError> {
    let buf = msg.encode();
    let iov = [IoSlice::new(&buf)];
    let fds = [msg.fd];
    let cmsgs: &[ControlMessage] = if msg.command == Command::OpenChannel && msg.fd >= 0 {
        &[ControlMessage::ScmRights(&fds)]
    } else {
        &[]
    };

    loop {
        match sendmsg::<()>(fd, &iov, cmsgs, MsgFlags::empty(), None) {
            Ok(n) if n == CHANNEL_MSG_SIZE => return Ok(true),
            Ok(n) => return Err(ChannelError::Truncated(n)),
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => return Ok(false),
            Err(e) => return Err(ChannelError::Sys(e)),
        }
    }
}

/// Read one record from a channel fd. `Ok(None)` means the socket is
/// drained (EAGAIN); `Err(Closed)` means the peer is gone. A received
/// descriptor replaces the fd field of the decoded record.
pub fn read_channel(fd: RawFd) -> Result<Option<ChannelMsg>, ChannelError> {
    let mut buf = [0u8; CHANNEL_MSG_SIZE];
    let mut received_fd: RawFd = -1;

    let bytes = loop {
        let mut iov = [IoSliceMut::new(&mut buf)];
        let mut cmsg_buffer = cmsg_space!([RawFd; 1]);
        match recvmsg::<()>(fd, &mut iov, Some(&mut cmsg_buffer), MsgFlags::empty()) {
            Ok(msg) => {
                if let Ok(cmsgs) = msg.cmsgs() {
                    for cmsg in cmsgs {
                        if let ControlMessageOwned::ScmRights(fds) = cmsg {
                            if let Some(first) = fds.first() {
                                received_fd = *first;
                            }
                        }
                    }
                }
                break msg.bytes;
            }
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => return Ok(None),
            Err(e) => return Err(ChannelError::Sys(e)),
        }
    };

    if bytes == 0 {
        return Err(ChannelError::Closed);
    }

    let mut msg = ChannelMsg::decode(&buf[..bytes])?;
    if received_fd >= 0 {
        msg.fd = received_fd;
    }
    Ok(Some(msg))
}

#[cfg(test)]
#[path = "channel_tests.rs"]
mod tests;
