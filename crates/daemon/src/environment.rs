// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Child environment rebuild.
//!
//! Children run with exactly the configured allowlist: a bare `NAME`
//! entry inherits the master's value, `NAME=value` sets a literal, and
//! `TZ` rides along whether or not it is listed.

use quay_conf::Config;

/// Build the environment a child should see.
pub fn build(config: &Config) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = Vec::with_capacity(config.env.len() + 1);
    let mut tz_listed = false;

    for entry in &config.env {
        if let Some((name, value)) = entry.split_once('=') {
            if name == "TZ" {
                tz_listed = true;
            }
            set(&mut env, name, value.to_string());
        } else {
            if entry == "TZ" {
                tz_listed = true;
            }
            if let Ok(value) = std::env::var(entry) {
                set(&mut env, entry, value);
            }
        }
    }

    if !tz_listed {
        if let Ok(value) = std::env::var("TZ") {
            set(&mut env, "TZ", value);
        }
    }

    env
}

// Later entries win, like repeated env directives.
fn set(env: &mut Vec<(String, String)>, name: &str, value: String) {
    if let Some(existing) = env.iter_mut().find(|(k, _)| k == name) {
        existing.1 = value;
    } else {
        env.push((name.to_string(), value));
    }
}

/// Replace this process's environment with the allowlist. Called in the
/// child after fork, before anything else looks at the environment; the
/// inherited-listener variable disappears here so reloads in the child
/// generation cannot re-trigger the inherit path.
pub fn apply(env: &[(String, String)]) {
    let current: Vec<String> = std::env::vars().map(|(key, _)| key).collect();
    for key in current {
        if !env.iter().any(|(name, _)| *name == key) {
            std::env::remove_var(&key);
        }
    }
    for (name, value) in env {
        std::env::set_var(name, value);
    }
}

#[cfg(test)]
#[path = "environment_tests.rs"]
mod tests;
