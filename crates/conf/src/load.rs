// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Config file loading, `-g` override merging, and validation.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use thiserror::Error;
use toml::Table;

use crate::model::Config;

#[derive(Debug, Error)]
pub enum ConfError {
    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid -g directives: {0}")]
    Directives(#[source] toml::de::Error),

    #[error("{0}")]
    Invalid(String),
}

/// Load the config file, merge `-g` overrides over its top level, and
/// validate the result. Paths are left as written; the caller resolves
/// them against the prefix.
pub fn load(path: &Path, overrides: Option<&str>) -> Result<Config, ConfError> {
    let text = std::fs::read_to_string(path)
        .map_err(|source| ConfError::Io { path: path.to_path_buf(), source })?;
    load_str(&text, path, overrides)
}

/// Like [`load`] but from already-read text; `path` is for error messages.
pub fn load_str(text: &str, path: &Path, overrides: Option<&str>) -> Result<Config, ConfError> {
    let mut table: Table = toml::from_str(text)
        .map_err(|source| ConfError::Parse { path: path.to_path_buf(), source })?;

    if let Some(extra) = overrides {
        let extra: Table = toml::from_str(extra).map_err(ConfError::Directives)?;
        for (key, value) in extra {
            table.insert(key, value);
        }
    }

    let config: Config = toml::Value::Table(table)
        .try_into()
        .map_err(|source| ConfError::Parse { path: path.to_path_buf(), source })?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<(), ConfError> {
    let mut addrs = HashSet::new();
    for listen in &config.listeners {
        if !addrs.insert(listen.addr) {
            return Err(ConfError::Invalid(format!("duplicate listen address {}", listen.addr)));
        }
        if listen.backlog < 1 {
            return Err(ConfError::Invalid(format!(
                "listen backlog {} for {} must be positive",
                listen.backlog, listen.addr
            )));
        }
    }

    let mut zone_names = HashSet::new();
    for zone in &config.zones {
        if zone.name.is_empty() {
            return Err(ConfError::Invalid("zone name must not be empty".into()));
        }
        if zone.size == 0 {
            return Err(ConfError::Invalid(format!("zone \"{}\" size must be positive", zone.name)));
        }
        if !zone_names.insert(zone.name.as_str()) {
            return Err(ConfError::Invalid(format!("duplicate zone \"{}\"", zone.name)));
        }
    }

    for cache in &config.cache_paths {
        if cache.path.as_os_str().is_empty() {
            return Err(ConfError::Invalid("cache_path path must not be empty".into()));
        }
    }

    // Parse affinity masks now so a bad mask fails `-t` instead of the
    // first worker spawn. The resolved masks are rebuilt by the cycle.
    if let Err(e) = quay_core::WorkerAffinity::parse(&config.worker_cpu_affinity, quay_core::os::ncpu())
    {
        return Err(ConfError::Invalid(format!("worker_cpu_affinity: {e}")));
    }

    if config.group.is_some() && config.user.is_none() {
        return Err(ConfError::Invalid("\"group\" requires \"user\"".into()));
    }

    Ok(())
}

#[cfg(test)]
#[path = "load_tests.rs"]
mod tests;
