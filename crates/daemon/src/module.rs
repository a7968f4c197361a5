// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The module table.
//!
//! A fixed registry of hooks invoked at the lifecycle points the
//! supervisor guarantees: `init_module` at cycle init (master, every
//! generation), `init_process` in every freshly forked child,
//! `exit_process` on worker exit, and `exit_master` on master exit.

use thiserror::Error;
use tracing::warn;

use crate::cycle::Cycle;

#[derive(Debug, Error)]
#[error("module \"{module}\": {message}")]
pub struct ModuleError {
    pub module: &'static str,
    pub message: String,
}

pub struct Module {
    pub name: &'static str,
    pub init_module: Option<fn(&Cycle) -> Result<(), ModuleError>>,
    pub init_process: Option<fn(&Cycle) -> Result<(), ModuleError>>,
    pub exit_process: Option<fn(&Cycle)>,
    pub exit_master: Option<fn(&Cycle)>,
}

static MODULES: &[Module] = &[
    Module {
        name: "event",
        init_module: None,
        init_process: Some(event_init_process),
        exit_process: None,
        exit_master: None,
    },
    Module {
        name: "cache",
        init_module: Some(cache_init_module),
        init_process: None,
        exit_process: None,
        exit_master: None,
    },
];

pub fn modules() -> &'static [Module] {
    MODULES
}

/// Warn when the descriptor budget is visibly too small for the
/// configured listener set.
fn event_init_process(cycle: &Cycle) -> Result<(), ModuleError> {
    let budget = quay_core::os::info().rlimit_nofile;
    let floor = (cycle.listeners.len() as u64) + 32;
    if budget < floor {
        warn!(rlimit_nofile = budget, "descriptor limit is too low for the configured listeners");
    }
    Ok(())
}

/// Cache roots must exist before the helpers or any worker touch them.
fn cache_init_module(cycle: &Cycle) -> Result<(), ModuleError> {
    for cache in &cycle.cache_paths {
        std::fs::create_dir_all(&cache.path).map_err(|e| ModuleError {
            module: "cache",
            message: format!("cannot create cache path {}: {e}", cache.path.display()),
        })?;
    }
    Ok(())
}
