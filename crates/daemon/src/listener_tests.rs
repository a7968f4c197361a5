// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::os::unix::io::IntoRawFd;

use yare::parameterized;

use super::*;

fn listen_conf(addr: &str) -> ListenConf {
    ListenConf { addr: addr.parse().unwrap(), backlog: 16, reuseport: false }
}

#[parameterized(
    semicolons = { "10;11;12;", &[10, 11, 12] },
    colons = { "10:11:12:", &[10, 11, 12] },
    mixed = { "10;11:12;", &[10, 11, 12] },
    no_trailing = { "7;8", &[7, 8] },
    empty = { "", &[] },
)]
fn inherited_lists_parse(value: &str, expected: &[RawFd]) {
    assert_eq!(parse_inherited(value).unwrap(), expected);
}

#[parameterized(
    garbage = { "10;banana;" },
    negative = { "10;-3;" },
)]
fn invalid_inherited_lists_are_rejected(value: &str) {
    assert!(matches!(parse_inherited(value), Err(ListenerError::InvalidFdList(_))));
}

#[test]
fn open_binds_and_accepts() {
    let listener = open(&listen_conf("127.0.0.1:0")).unwrap();
    assert!(!listener.inherited);

    // Recover the ephemeral port and connect through it.
    let bound: SockaddrIn = getsockname(listener.raw_fd().unwrap()).unwrap();
    let stream = std::net::TcpStream::connect(("127.0.0.1", bound.port()));
    assert!(stream.is_ok(), "connect failed: {stream:?}");
}

#[test]
fn inherit_recovers_address_and_type() {
    let listener = open(&listen_conf("127.0.0.1:0")).unwrap();
    let bound: SockaddrIn = getsockname(listener.raw_fd().unwrap()).unwrap();
    let port = bound.port();

    // Steal the raw descriptor as if it came through the environment.
    let arc = listener.fd.unwrap();
    let fd = Arc::try_unwrap(arc).unwrap().into_raw_fd();

    let inherited = inherit(&format!("{fd};")).unwrap();
    assert_eq!(inherited.len(), 1);
    let adopted = &inherited[0];
    assert!(adopted.inherited);
    assert_eq!(adopted.addr.port(), port);
    assert!(adopted.addr.ip().is_loopback());
}

#[test]
fn inherit_skips_dead_descriptors() {
    // fd 600 is almost certainly not open in the test process.
    let inherited = inherit("600;").unwrap();
    assert!(inherited.is_empty());
}

#[test]
fn close_drops_the_descriptor() {
    let mut listener = open(&listen_conf("127.0.0.1:0")).unwrap();
    assert!(listener.raw_fd().is_some());
    listener.close();
    assert!(listener.raw_fd().is_none());
}
