// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The configuration cycle.
//!
//! One `Cycle` is one configuration generation: the parsed config, the
//! bound listeners, the mapped shared zones, the rebuilt child
//! environment, and the open log handles. A cycle is immutable once
//! built; a reload constructs a new cycle next to the running one and the
//! master swaps only after the new cycle validated. Ownership is the
//! arena: everything allocated for a generation is dropped, in reverse
//! field order, when the cycle goes.

use std::path::PathBuf;
use std::time::Duration;

use nix::unistd::{Gid, Group, Uid, User};
use quay_conf::{Config, ConfError};
use thiserror::Error;
use tracing::{info, warn};

use crate::listener::{self, Listener, ListenerError};
use crate::logfile::{AccessLog, ErrorLog};
use crate::module::{modules, ModuleError};
use crate::zone::{SharedZone, ZoneError};
use crate::{environment, logfile};

/// Where the error log should go; `-e` overrides the config.
#[derive(Debug, Clone)]
pub enum LogTarget {
    Stderr,
    File(PathBuf),
}

/// Invocation parameters a reload must reuse verbatim.
#[derive(Debug, Clone)]
pub struct BootInfo {
    pub prefix: PathBuf,
    pub conf_file: PathBuf,
    /// `-g` text, merged over the file's top level.
    pub directives: Option<String>,
    /// `-e` override.
    pub error_log: Option<LogTarget>,
}

pub struct InitOptions {
    pub boot: BootInfo,
    /// Listeners adopted from a predecessor binary (first cycle only).
    pub inherited: Vec<Listener>,
    /// `false` in config-test and signaller modes: validate without
    /// binding.
    pub open_sockets: bool,
}

/// A cache directory root with its helper-process duties.
#[derive(Debug, Clone)]
pub struct CachePath {
    pub path: PathBuf,
    pub manager: bool,
    pub loader: bool,
    pub inactive: Duration,
    pub interval: Duration,
}

#[derive(Debug)]
pub struct Cycle {
    pub generation: u64,
    pub config: Config,
    pub boot: BootInfo,
    pub listeners: Vec<Listener>,
    pub cache_paths: Vec<CachePath>,
    pub zones: Vec<SharedZone>,
    /// Child environment allowlist, resolved against the master's
    /// environment at cycle init.
    pub env: Vec<(String, String)>,
    /// Shared error-log handle; [`Cycle::install_error_log`] points it at
    /// this cycle's target.
    pub error_log: ErrorLog,
    /// Resolved error-log path; `None` keeps stderr.
    pub error_log_path: Option<PathBuf>,
    pub access_log: Option<AccessLog>,
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Conf(#[from] ConfError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Zone(#[from] ZoneError),

    #[error("cannot open log {}: {source}", .path.display())]
    Log {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Module(#[from] ModuleError),
}

impl Cycle {
    /// Build a cycle: parse and validate the configuration, bind (or
    /// carry over) listeners, map shared zones, and run every module's
    /// `init_module` hook. On error the partial cycle is dropped and the
    /// caller keeps whatever it was running before.
    pub fn init(
        prev: Option<&Cycle>,
        error_log: ErrorLog,
        opts: InitOptions,
    ) -> Result<Cycle, CycleError> {
        let InitOptions { boot, inherited, open_sockets } = opts;

        let mut config = quay_conf::load(&boot.conf_file, boot.directives.as_deref())?;
        config.resolve_paths(&boot.prefix);

        let env = environment::build(&config);

        let error_log_path = match &boot.error_log {
            Some(LogTarget::Stderr) => None,
            Some(LogTarget::File(path)) => Some(rebase(path.clone(), &boot.prefix)),
            None => config.error_log.clone(),
        };
        if let Some(path) = &error_log_path {
            logfile::probe(path)
                .map_err(|source| CycleError::Log { path: path.clone(), source })?;
        }

        let listeners =
            if open_sockets { open_listeners(&config, prev, inherited)? } else { Vec::new() };

        let mut zones = Vec::new();
        for zone_conf in &config.zones {
            let carried = prev.and_then(|prev| {
                prev.zones
                    .iter()
                    .find(|z| z.name() == zone_conf.name && z.size() == zone_conf.size)
                    .cloned()
            });
            match carried {
                Some(zone) => zones.push(zone),
                None => zones.push(SharedZone::map(zone_conf)?),
            }
        }

        let cache_paths = config
            .cache_paths
            .iter()
            .map(|c| CachePath {
                path: c.path.clone(),
                manager: c.manager,
                loader: c.loader,
                inactive: Duration::from_millis(c.inactive),
                interval: Duration::from_millis(c.interval),
            })
            .collect();

        let access_log = match &config.access_log {
            Some(path) => Some(
                AccessLog::open(path)
                    .map_err(|source| CycleError::Log { path: path.clone(), source })?,
            ),
            None => None,
        };

        let cycle = Cycle {
            generation: prev.map_or(1, |p| p.generation + 1),
            config,
            boot,
            listeners,
            cache_paths,
            zones,
            env,
            error_log,
            error_log_path,
            access_log,
        };

        for module in modules() {
            if let Some(hook) = module.init_module {
                hook(&cycle)?;
            }
        }

        if cycle.generation > 1 {
            info!(generation = cycle.generation, "configuration cycle rebuilt");
        }
        Ok(cycle)
    }

    /// Rebuild from the same invocation parameters, carrying listeners
    /// and zones whose definition did not change.
    pub fn reload(prev: &Cycle) -> Result<Cycle, CycleError> {
        Cycle::init(
            Some(prev),
            prev.error_log.clone(),
            InitOptions { boot: prev.boot.clone(), inherited: Vec::new(), open_sockets: true },
        )
    }

    /// Point the shared error log at this cycle's target.
    pub fn install_error_log(&self) -> std::io::Result<()> {
        self.error_log.retarget(self.error_log_path.as_deref())
    }

    /// Close this process's copies of the listening descriptors. In the
    /// master this stops new connections system-wide once the workers
    /// have closed theirs.
    pub fn close_listeners(&mut self) {
        for listener in &mut self.listeners {
            listener.close();
        }
    }
}

fn open_listeners(
    config: &Config,
    prev: Option<&Cycle>,
    inherited: Vec<Listener>,
) -> Result<Vec<Listener>, CycleError> {
    let mut pool = inherited;
    let mut listeners = Vec::with_capacity(config.listeners.len());

    for conf in &config.listeners {
        // Reload: an unchanged address keeps its descriptor, so a
        // successful reload preserves the listener set with no bind
        // window.
        let carried = prev.and_then(|prev| {
            prev.listeners
                .iter()
                .find(|l| l.addr == conf.addr && l.reuseport == conf.reuseport && l.fd.is_some())
                .cloned()
        });
        if let Some(mut listener) = carried {
            listener.ignore = false;
            listener.backlog = conf.backlog;
            listeners.push(listener);
            continue;
        }

        // First generation after an upgrade: adopt the predecessor's
        // descriptor instead of binding.
        if let Some(pos) = pool.iter().position(|l| l.addr == conf.addr) {
            let mut adopted = pool.swap_remove(pos);
            adopted.backlog = conf.backlog;
            listeners.push(adopted);
            continue;
        }

        listeners.push(listener::open(conf)?);
    }

    for leftover in pool {
        warn!(addr = %leftover.addr, "closing inherited listener with no matching listen entry");
    }

    Ok(listeners)
}

/// Uid/gid log files should be chowned to on reopen, when the master is
/// root and a drop user is configured.
pub fn log_owner(config: &Config) -> Option<(Uid, Gid)> {
    let user = config.user.as_deref()?;
    if !Uid::effective().is_root() {
        return None;
    }
    let pwd = User::from_name(user).ok().flatten()?;
    let gid = match config.group.as_deref() {
        Some(group) => Group::from_name(group).ok().flatten()?.gid,
        None => pwd.gid,
    };
    Some((pwd.uid, gid))
}

fn rebase(path: PathBuf, prefix: &std::path::Path) -> PathBuf {
    if path.is_relative() {
        prefix.join(path)
    } else {
        path
    }
}

#[cfg(test)]
#[path = "cycle_tests.rs"]
mod tests;
