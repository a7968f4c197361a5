// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Configuration model for the main context.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Config file path relative to the prefix when `-c` is not given.
pub const DEFAULT_CONF_FILE: &str = "quay.toml";

/// Parsed main-context configuration.
///
/// All relative paths are resolved against the prefix by
/// [`Config::resolve_paths`] before the config is handed to a cycle.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Detach from the terminal at startup.
    #[serde(default = "default_true")]
    pub daemon: bool,

    /// Run the master/worker supervision tree. `false` keeps everything in
    /// one foreground process, for debugging.
    #[serde(default = "default_true")]
    pub master: bool,

    #[serde(default)]
    pub worker_processes: WorkerCount,

    #[serde(default = "default_pid")]
    pub pid: PathBuf,

    /// Unprivileged user workers drop to when the master runs as root.
    #[serde(default)]
    pub user: Option<String>,

    /// Group for the drop; defaults to the user's login group.
    #[serde(default)]
    pub group: Option<String>,

    #[serde(default)]
    pub working_directory: Option<PathBuf>,

    /// Worker nice value; 0 leaves the priority alone.
    #[serde(default)]
    pub priority: i32,

    #[serde(default)]
    pub worker_rlimit_nofile: Option<u64>,

    #[serde(default)]
    pub worker_rlimit_core: Option<u64>,

    /// Bitmask strings, one per worker, or `["auto"]`.
    #[serde(default)]
    pub worker_cpu_affinity: Vec<String>,

    /// Environment allowlist for children: bare `NAME` inherits from the
    /// master's environment, `NAME=value` sets a literal.
    #[serde(default)]
    pub env: Vec<String>,

    /// Milliseconds a gracefully shutting down worker waits for in-flight
    /// connections before closing them; 0 waits forever.
    #[serde(default)]
    pub shutdown_timeout: u64,

    /// Event-loop time cache granularity in milliseconds; 0 updates on
    /// every wakeup only.
    #[serde(default)]
    pub timer_resolution: u64,

    /// What a worker does when it detects a leaked connection at exit.
    #[serde(default)]
    pub debug_points: Option<DebugPoints>,

    /// Keep CAP_NET_RAW across the privilege drop for transparent
    /// proxying.
    #[serde(default)]
    pub transparent: bool,

    /// Error log path; absent means stderr (or the `-e` override).
    #[serde(default)]
    pub error_log: Option<PathBuf>,

    /// Per-connection access log; absent disables it.
    #[serde(default)]
    pub access_log: Option<PathBuf>,

    #[serde(default, rename = "listen")]
    pub listeners: Vec<ListenConf>,

    #[serde(default, rename = "cache_path")]
    pub cache_paths: Vec<CachePathConf>,

    #[serde(default, rename = "zone")]
    pub zones: Vec<ZoneConf>,
}

/// `worker_processes`: a count or `"auto"` (= online CPUs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCount {
    Count(u32),
    Auto,
}

impl Default for WorkerCount {
    fn default() -> Self {
        Self::Count(1)
    }
}

impl<'de> Deserialize<'de> for WorkerCount {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::{Error, Unexpected, Visitor};

        struct CountVisitor;

        impl Visitor<'_> for CountVisitor {
            type Value = WorkerCount;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a worker count or \"auto\"")
            }

            fn visit_i64<E: Error>(self, value: i64) -> Result<Self::Value, E> {
                u32::try_from(value)
                    .map(WorkerCount::Count)
                    .map_err(|_| Error::invalid_value(Unexpected::Signed(value), &self))
            }

            fn visit_u64<E: Error>(self, value: u64) -> Result<Self::Value, E> {
                u32::try_from(value)
                    .map(WorkerCount::Count)
                    .map_err(|_| Error::invalid_value(Unexpected::Unsigned(value), &self))
            }

            fn visit_str<E: Error>(self, value: &str) -> Result<Self::Value, E> {
                if value == "auto" {
                    Ok(WorkerCount::Auto)
                } else {
                    Err(Error::invalid_value(Unexpected::Str(value), &self))
                }
            }
        }

        deserializer.deserialize_any(CountVisitor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DebugPoints {
    /// Raise SIGSTOP so a debugger can attach.
    Stop,
    /// Abort and dump core.
    Abort,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenConf {
    pub addr: SocketAddr,

    #[serde(default = "default_backlog")]
    pub backlog: i32,

    /// Each worker binds its own socket with SO_REUSEPORT.
    #[serde(default)]
    pub reuseport: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CachePathConf {
    pub path: PathBuf,

    /// Run the cache manager over this path.
    #[serde(default)]
    pub manager: bool,

    /// Walk this path once at startup in the cache loader.
    #[serde(default)]
    pub loader: bool,

    /// Entry lifetime in milliseconds; the manager removes older files.
    #[serde(default = "default_inactive")]
    pub inactive: u64,

    /// Suggested delay in milliseconds between manager passes over this
    /// path.
    #[serde(default = "default_manager_interval")]
    pub interval: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ZoneConf {
    pub name: String,
    /// Mapping size in bytes.
    pub size: usize,
}

impl Config {
    /// Resolve the configured worker count against the online CPU count.
    pub fn worker_count(&self, ncpu: usize) -> u32 {
        match self.worker_processes {
            WorkerCount::Auto => ncpu.max(1) as u32,
            WorkerCount::Count(n) => n,
        }
    }

    /// Rebase every relative path on the prefix.
    pub fn resolve_paths(&mut self, prefix: &Path) {
        resolve(&mut self.pid, prefix);
        if let Some(path) = self.error_log.as_mut() {
            resolve(path, prefix);
        }
        if let Some(path) = self.access_log.as_mut() {
            resolve(path, prefix);
        }
        if let Some(path) = self.working_directory.as_mut() {
            resolve(path, prefix);
        }
        for cache in &mut self.cache_paths {
            resolve(&mut cache.path, prefix);
        }
    }

    /// PID file path the old master keeps during a binary upgrade.
    pub fn oldbin_path(&self) -> PathBuf {
        let mut name = self.pid.as_os_str().to_os_string();
        name.push(".oldbin");
        PathBuf::from(name)
    }
}

fn resolve(path: &mut PathBuf, prefix: &Path) {
    if path.is_relative() {
        *path = prefix.join(&*path);
    }
}

fn default_true() -> bool {
    true
}

fn default_pid() -> PathBuf {
    PathBuf::from("quay.pid")
}

fn default_backlog() -> i32 {
    511
}

fn default_inactive() -> u64 {
    10 * 60 * 1000
}

fn default_manager_interval() -> u64 {
    10 * 1000
}

#[cfg(test)]
#[path = "model_tests.rs"]
mod tests;
