// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Quay configuration.
//!
//! The config file is TOML with a flat top level (the main context) plus
//! `[[listen]]`, `[[cache_path]]`, and `[[zone]]` tables. `-g` accepts
//! extra top-level TOML text merged over the file, highest priority.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

mod load;
mod model;

pub use load::{load, load_str, ConfError};
pub use model::{
    CachePathConf, Config, DebugPoints, ListenConf, WorkerCount, ZoneConf, DEFAULT_CONF_FILE,
};
