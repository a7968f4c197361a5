// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Quay core primitives.
//!
//! OS probing, the cached clock, the master/child channel record, and CPU
//! affinity masks. Everything here is process-agnostic: the fork-side code
//! lives in `quay-daemon`.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod affinity;
pub mod channel;
pub mod clock;
pub mod os;

pub use affinity::{AffinityError, WorkerAffinity};
pub use channel::{ChannelError, ChannelMsg, Command, CHANNEL_MSG_SIZE};
pub use os::OsInfo;
