//! # DynaMake
//!
//! A build engine with first-class support for **dynamic build graphs**: a
//! step may discover its dependencies from the contents of other inputs,
//! and may produce an a-priori-unknown set of outputs matched by glob
//! patterns. Parameter values read by a step are part of its persistent
//! state, so changing a parameter rebuilds exactly the steps that read it
//! even when no file timestamp changed.
//!
//! ## Quick Example
//!
//! ```no_run
//! use dynamake::{Make, Result};
//!
//! fn main() -> Result<()> {
//!     let mut make = Make::new();
//!
//!     // A pattern step: building `obj/X.o` compiles `src/X.c`.
//!     make.step("compile", ["obj/{*name}.o"], |context| {
//!         let name = context.binding("name")?.to_owned();
//!         let source = format!("src/{name}.c");
//!         let object = format!("obj/{name}.o");
//!         context.require(source.as_str())?;
//!         context.shell(["cc", "-c", source.as_str(), "-o", object.as_str()])
//!     })?;
//!
//!     make.build(&["obj/a.o"])?;
//!     Ok(())
//! }
//! ```
//!
//! ## Core Concepts
//!
//! - **Patterns (`patterns`)**: `obj/{*name}.o` style capture patterns
//!   resolve required paths to the steps that produce them and extract the
//!   step instance's bindings. Non-captured holes (`{**_file}`) declare
//!   dynamic outputs whose concrete names are only learned after execution.
//! - **Annotations (`annotations`)**: paths carry `optional` / `exists` /
//!   `precious` / `phony` / `emphasized` flags through every transform.
//! - **The executor (`exec`)**: step bodies receive a
//!   [`StepContext`] and declare dependencies with `require`, wait on them
//!   with `sync`, and run external commands with `shell`/`spawn`. Actions
//!   of independent steps run in parallel, gated by resource budgets.
//! - **Up-to-date decisions (`oracle`, `persist`, `stat`)**: a per-instance
//!   persistent record of inputs, outputs, sub-steps, command fingerprints
//!   and read parameters decides — together with nanosecond file times —
//!   which actions can be skipped.
//! - **Parameters (`params`)**: typed values resolved from defaults,
//!   `DynaMake.yaml`, `--config` files and command-line overrides; also the
//!   source of resource budgets like `jobs`.
//!
//! ## Execution Flow
//!
//! A build starts from the requested targets: each is resolved through the
//! rule registry to a step instance, which runs its body. Bodies require
//! further paths (starting their producers), sync on them, and run actions;
//! the oracle skips actions whose inputs, outputs, commands and parameters
//! are unchanged since the last successful run. On success the persistent
//! record is atomically replaced; on failure stale outputs are scrubbed
//! (unless `precious`) and the previous record is kept.

pub mod action;
pub mod annotations;
pub mod cli;
pub mod error;
pub mod exec;
pub mod oracle;
pub mod params;
pub mod patterns;
pub mod persist;
pub mod registry;
pub mod stat;

pub use annotations::{clean_path, emphasized, exists, optional, phony, precious, APath};
pub use error::{Error, Result};
pub use exec::{BuildReport, Make, StepContext};
pub use params::ParamKind;
pub use patterns::{fmt, fmt_capture, format_pattern, Bindings, Captured, Pattern};
pub use registry::StepConfig;
