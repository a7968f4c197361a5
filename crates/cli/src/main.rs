// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `quay` - the server binary.
//!
//! One executable is the whole surface: CLI front end, config tester,
//! signaller for a running master, and (once startup completes) the
//! master process itself. Workers are forked from the master, never
//! exec'd.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use quay_daemon::cycle::LogTarget;
use quay_daemon::{
    listener, logfile, pid, signals, BootInfo, Cycle, ErrorLog, InitOptions, Master,
    LISTENER_FDS_VAR,
};
use tracing::{info, warn};

const VERSION: &str = concat!("quay/", env!("CARGO_PKG_VERSION"));
const BUILD: &str = concat!(env!("CARGO_PKG_VERSION"), "+", env!("BUILD_GIT_HASH"));

#[derive(Parser, Debug)]
#[command(
    name = "quay",
    disable_version_flag = true,
    about = "quay - a pre-forking stream server",
    override_usage = "quay [-?hvVtTq] [-s signal] [-p prefix] [-e filename] [-c filename] [-g directives]"
)]
struct Options {
    /// Show version and exit
    #[arg(short = 'v')]
    version: bool,

    /// Show version and build information, then exit
    #[arg(short = 'V')]
    version_build: bool,

    /// Test configuration and exit
    #[arg(short = 't')]
    test_config: bool,

    /// Test configuration, dump it, and exit
    #[arg(short = 'T')]
    dump_config: bool,

    /// Suppress non-error messages during configuration testing
    #[arg(short = 'q')]
    quiet: bool,

    /// Send a signal to the master process: stop, quit, reopen, reload
    #[arg(short = 's', value_name = "SIGNAL")]
    signal: Option<String>,

    /// Set the prefix path (default: current directory)
    #[arg(short = 'p', value_name = "PREFIX")]
    prefix: Option<PathBuf>,

    /// Set the error log file, or "stderr"
    #[arg(short = 'e', value_name = "FILE")]
    error_log: Option<PathBuf>,

    /// Set the configuration file (default: quay.toml under the prefix)
    #[arg(short = 'c', value_name = "FILE")]
    conf: Option<PathBuf>,

    /// Set global directives outside the configuration file (TOML text)
    #[arg(short = 'g', value_name = "DIRECTIVES")]
    directives: Option<String>,
}

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let argv: Vec<OsString> = std::env::args_os().collect();

    // `-?` is the traditional spelling of help.
    let parse_args = argv
        .iter()
        .map(|arg| if arg == "-?" { OsString::from("-h") } else { arg.clone() });
    let opts = match Options::try_parse_from(parse_args) {
        Ok(opts) => opts,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            return code;
        }
    };

    if opts.version || opts.version_build {
        eprintln!("quay version {VERSION}");
        if opts.version_build {
            eprintln!("build: {BUILD}");
        }
        if !(opts.test_config || opts.dump_config) {
            return 0;
        }
    }

    let error_log = ErrorLog::stderr();
    logfile::init(&error_log);
    quay_core::clock::update();
    quay_core::os::info();

    match start(opts, argv, error_log) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("quay: {e:#}");
            1
        }
    }
}

/// Everything past flag parsing. Only the error path returns to `run`;
/// master and single-process modes never come back.
fn start(opts: Options, argv: Vec<OsString>, error_log: ErrorLog) -> Result<i32> {
    let test_config = opts.test_config || opts.dump_config;

    let boot = boot_info(&opts)?;

    // Signaller mode needs the config only for the PID file path.
    if let Some(name) = &opts.signal {
        let mut config = quay_conf::load(&boot.conf_file, boot.directives.as_deref())?;
        config.resolve_paths(&boot.prefix);
        signals::signal_process(&config.pid, name)
            .map_err(|e| anyhow!("sending {name}: {e}"))?;
        return Ok(0);
    }

    // Listeners a predecessor binary left for us.
    let inherited = match std::env::var(LISTENER_FDS_VAR) {
        Ok(value) if !value.is_empty() => {
            info!(%value, "using inherited sockets");
            listener::inherit(&value).context("inherited listener list")?
        }
        _ => Vec::new(),
    };
    let is_upgrade_child = !inherited.is_empty();

    let cycle = match Cycle::init(
        None,
        error_log.clone(),
        InitOptions { boot: boot.clone(), inherited, open_sockets: !test_config },
    ) {
        Ok(cycle) => cycle,
        Err(e) => {
            if test_config {
                eprintln!("quay: {e:#}");
                eprintln!(
                    "quay: configuration file {} test failed",
                    boot.conf_file.display()
                );
                return Ok(1);
            }
            return Err(e).context("startup");
        }
    };

    if test_config {
        if !opts.quiet {
            eprintln!(
                "quay: configuration file {} test is successful",
                boot.conf_file.display()
            );
        }
        if opts.dump_config {
            dump_config(&cycle)?;
        }
        return Ok(0);
    }

    signals::init_signals().map_err(|e| anyhow!("installing signal handlers: {e}"))?;

    // Point the shared error log at the configured target before anything
    // forks or detaches.
    cycle
        .install_error_log()
        .with_context(|| format!("opening error log for {}", boot.conf_file.display()))?;

    if cycle.config.daemon && !is_upgrade_child {
        nix::unistd::daemon(true, false).map_err(|e| anyhow!("daemonize failed: {e}"))?;
    }

    let pid_file = pid::create(&cycle.config.pid)?;
    info!(version = VERSION, pid = std::process::id(), "starting");

    if cycle.config.master {
        quay_daemon::master_process_cycle(Master { cycle, pid_file, argv })
    } else {
        warn!("master_process is off, running in single-process mode");
        quay_daemon::single_process_cycle(cycle, pid_file)
    }
}

fn boot_info(opts: &Options) -> Result<BootInfo> {
    let prefix = match &opts.prefix {
        Some(prefix) => prefix.clone(),
        None => std::env::current_dir().context("cannot determine the prefix directory")?,
    };

    let conf_file = match &opts.conf {
        Some(conf) => rebase(conf.clone(), &prefix),
        None => prefix.join(quay_conf::DEFAULT_CONF_FILE),
    };

    let error_log = opts.error_log.as_ref().map(|path| {
        if path.as_os_str() == "stderr" {
            LogTarget::Stderr
        } else {
            LogTarget::File(path.clone())
        }
    });

    Ok(BootInfo { prefix, conf_file, directives: opts.directives.clone(), error_log })
}

fn rebase(path: PathBuf, prefix: &Path) -> PathBuf {
    if path.is_relative() {
        prefix.join(path)
    } else {
        path
    }
}

fn dump_config(cycle: &Cycle) -> Result<()> {
    use std::io::Write;

    let text = std::fs::read_to_string(&cycle.boot.conf_file)
        .with_context(|| format!("cannot re-read {}", cycle.boot.conf_file.display()))?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    writeln!(out, "# configuration file {}:", cycle.boot.conf_file.display())?;
    out.write_all(text.as_bytes())?;
    if !text.ends_with('\n') {
        writeln!(out)?;
    }
    Ok(())
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod tests;
