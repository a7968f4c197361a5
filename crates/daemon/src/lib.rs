// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Quay process-lifecycle core.
//!
//! The master/worker supervision tree: configuration cycles, process
//! spawning and reaping, the socketpair control channel, signal-driven
//! master and worker loops, log rotation, binary upgrade, and the cache
//! helper processes.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod cache;
pub mod cycle;
pub mod environment;
pub mod event;
pub mod listener;
pub mod logfile;
pub mod master;
pub mod module;
pub mod pid;
pub mod process;
pub mod signals;
pub mod spawn;
pub mod upgrade;
pub mod worker;
pub mod zone;

pub use cycle::{BootInfo, Cycle, CycleError, InitOptions, LogTarget};
pub use logfile::ErrorLog;
pub use master::{master_process_cycle, single_process_cycle, Master};
pub use pid::{PidFile, PidError};
pub use upgrade::LISTENER_FDS_VAR;
