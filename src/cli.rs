//! # Command-Line Entry Point
//!
//! DynaMake is a library: build steps are Rust code registered on a
//! [`Make`] value, so every project ships its own binary. This module is
//! the generic `main` for such binaries. It exposes the engine's flag
//! surface, loads the configuration files, initializes logging, and builds
//! the requested targets:
//!
//! ```no_run
//! use dynamake::{cli, Make};
//!
//! fn main() -> std::process::ExitCode {
//!     let mut make = Make::new();
//!     // ... register steps and parameters ...
//!     cli::main(&mut make, &["all"])
//! }
//! ```
//!
//! Engine parameters are exposed as long flags (`--jobs 4`,
//! `--failure_aborts_build false`); user-defined parameters are set with
//! `-p name=value`. The `FILE`, `WHY` and `TRACE` log levels sit between
//! `INFO` and `DEBUG`, each adding to the previous one: `FILE` shows the
//! touch/remove bookkeeping on output files, `WHY` adds the reasons actions
//! could not be skipped, `TRACE` adds each step invocation.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use log::LevelFilter;
use serde_yaml::Value;

use crate::error::{Error, Result};
use crate::exec::{BuildReport, Make};
use crate::params;

/// Build some target(s) using DynaMake
#[derive(Parser, Debug)]
#[command(name = "dynamake", version)]
pub struct Cli {
    /// The file or target to make
    #[arg(value_name = "TARGET")]
    pub targets: Vec<String>,

    /// Load a parameters configuration YAML file
    #[arg(long, short = 'c', value_name = "FILE")]
    pub config: Vec<PathBuf>,

    /// Override a parameter value
    #[arg(long, short = 'p', value_name = "NAME=VALUE")]
    pub param: Vec<String>,

    /// The number of jobs to run in parallel (0 for unlimited, negative for
    /// a fraction of the logical processors)
    #[arg(long, short = 'j', value_name = "INT", allow_negative_numbers = true)]
    pub jobs: Option<i64>,

    /// The log level to use (ERROR, WARN, INFO, FILE, WHY, TRACE, DEBUG)
    #[arg(long = "log_level", value_name = "STR")]
    pub log_level: Option<String>,

    /// Whether to log (level INFO) skipped actions
    #[arg(long = "log_skipped_actions", value_name = "BOOL")]
    pub log_skipped_actions: Option<String>,

    /// Whether to rebuild outputs if the actions have changed
    #[arg(long = "rebuild_changed_actions", value_name = "BOOL")]
    pub rebuild_changed_actions: Option<String>,

    /// The directory to keep persistent data in
    #[arg(long = "persistent_directory", value_name = "STR")]
    pub persistent_directory: Option<String>,

    /// Whether to stop the build if any action fails
    #[arg(long = "failure_aborts_build", value_name = "BOOL")]
    pub failure_aborts_build: Option<String>,

    /// Whether to remove old output files before executing an action
    #[arg(long = "remove_stale_outputs", value_name = "BOOL")]
    pub remove_stale_outputs: Option<String>,

    /// Whether to touch output files on a successful action
    #[arg(long = "touch_success_outputs", value_name = "BOOL")]
    pub touch_success_outputs: Option<String>,

    /// Whether to remove output files on a failing action
    #[arg(long = "remove_failed_outputs", value_name = "BOOL")]
    pub remove_failed_outputs: Option<String>,

    /// Whether to remove directories becoming empty when deleting a file
    #[arg(long = "remove_empty_directories", value_name = "BOOL")]
    pub remove_empty_directories: Option<String>,

    /// Whether to wait for NFS outputs to become visible
    #[arg(long = "wait_nfs_outputs", value_name = "BOOL")]
    pub wait_nfs_outputs: Option<String>,

    /// How many seconds to wait for NFS outputs
    #[arg(long = "nfs_outputs_timeout", value_name = "SEC")]
    pub nfs_outputs_timeout: Option<i64>,

    /// Stop before the first action that would have to run (dry run)
    #[arg(long = "no_actions", short = 'n')]
    pub no_actions: bool,

    /// List all the build steps and their outputs, and exit
    #[arg(long = "list_steps")]
    pub list_steps: bool,
}

/// A generic `main` for DynaMake binaries: parse the command line, apply it
/// to the given engine, and build the targets (or the default targets when
/// none are given).
pub fn main(make: &mut Make, default_targets: &[&str]) -> ExitCode {
    let cli = Cli::parse();
    match execute(cli, make, default_targets) {
        Ok(_) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("dynamake: {error}");
            ExitCode::FAILURE
        }
    }
}

/// Apply parsed arguments to the engine and build. Split from [`main`] so
/// embedding programs and tests can drive it with explicit arguments.
pub fn execute(cli: Cli, make: &mut Make, default_targets: &[&str]) -> Result<BuildReport> {
    {
        let store = make.params_mut();
        let default_config = Path::new(params::DEFAULT_CONFIG);
        if default_config.exists() {
            store.load_config(default_config)?;
        }
        for path in &cli.config {
            store.load_config(path)?;
        }

        if let Some(jobs) = cli.jobs {
            store.set("jobs", Value::from(jobs))?;
        }
        if let Some(timeout) = cli.nfs_outputs_timeout {
            store.set("nfs_outputs_timeout", Value::from(timeout))?;
        }
        let overrides: [(&str, &Option<String>); 10] = [
            ("log_level", &cli.log_level),
            ("log_skipped_actions", &cli.log_skipped_actions),
            ("rebuild_changed_actions", &cli.rebuild_changed_actions),
            ("persistent_directory", &cli.persistent_directory),
            ("failure_aborts_build", &cli.failure_aborts_build),
            ("remove_stale_outputs", &cli.remove_stale_outputs),
            ("touch_success_outputs", &cli.touch_success_outputs),
            ("remove_failed_outputs", &cli.remove_failed_outputs),
            ("remove_empty_directories", &cli.remove_empty_directories),
            ("wait_nfs_outputs", &cli.wait_nfs_outputs),
        ];
        for (name, text) in overrides {
            if let Some(text) = text {
                store.override_from(name, text)?;
            }
        }
        if cli.no_actions {
            store.set("no_actions", Value::Bool(true))?;
        }

        for assignment in &cli.param {
            let (name, value) = assignment.split_once('=').ok_or_else(|| Error::Config {
                message: format!("Invalid parameter override: {assignment} (expected NAME=VALUE)"),
            })?;
            store.override_from(name, value)?;
        }
    }

    init_logger(&make.params().get_str("log_level")?)?;

    if cli.list_steps {
        print!("{}", make.list_steps());
        return Ok(BuildReport {
            actions: 0,
            skipped: 0,
            dry_stopped: false,
        });
    }

    let targets: Vec<&str> = if cli.targets.is_empty() {
        default_targets.to_vec()
    } else {
        cli.targets.iter().map(String::as_str).collect()
    };
    make.build(&targets)
}

/// Initialize the logger for the given level.
///
/// `FILE` maps to `INFO` plus the `file` target at debug, `WHY` adds the
/// `why` target, `TRACE` adds the `trace` target as well. Repeated
/// initialization (tests, repeated builds in one process) is tolerated.
fn init_logger(level: &str) -> Result<()> {
    let mut builder = env_logger::Builder::from_default_env();
    builder
        .format_timestamp_millis()
        .format_module_path(false)
        .format_target(false);
    apply_log_level(&mut builder, level)?;
    let _ = builder.try_init();
    Ok(())
}

fn apply_log_level(builder: &mut env_logger::Builder, level: &str) -> Result<()> {
    match level.to_uppercase().as_str() {
        "ERROR" => builder.filter_level(LevelFilter::Error),
        "WARN" => builder.filter_level(LevelFilter::Warn),
        "INFO" => builder.filter_level(LevelFilter::Info),
        "FILE" => builder
            .filter_level(LevelFilter::Info)
            .filter(Some("file"), LevelFilter::Debug),
        "WHY" => builder
            .filter_level(LevelFilter::Info)
            .filter(Some("file"), LevelFilter::Debug)
            .filter(Some("why"), LevelFilter::Debug),
        "TRACE" => builder
            .filter_level(LevelFilter::Info)
            .filter(Some("file"), LevelFilter::Debug)
            .filter(Some("why"), LevelFilter::Debug)
            .filter(Some("trace"), LevelFilter::Debug),
        "DEBUG" => builder.filter_level(LevelFilter::Debug),
        "OFF" => builder.filter_level(LevelFilter::Off),
        _ => {
            return Err(Error::Config {
                message: format!(
                    "Invalid log level: '{level}'. \
                     Valid options are: error, warn, info, file, why, trace, debug, off"
                ),
            })
        }
    };
    Ok(())
}
