//! # Parameter Store
//!
//! Build parameters configure both the engine itself (`jobs`,
//! `failure_aborts_build`, …) and the user's build logic (optimization
//! modes, tool paths, resource budgets). Each parameter has a typed default
//! and is resolved with a fixed precedence, lowest first:
//!
//! 1. the hard-coded default (or its environment fallback),
//! 2. the `DynaMake.yaml` configuration file in the working directory,
//! 3. each `--config` file, in order,
//! 4. an explicit command-line override.
//!
//! A configuration file is a top-level mapping of parameter names to values.
//! An unknown name is an error unless it is suffixed with `?`, in which case
//! it is silently ignored; this lets several projects share one
//! configuration file.
//!
//! Reading a parameter from inside a step (through
//! [`StepContext::parameter`](crate::exec::StepContext::parameter))
//! contributes the resolved value to that step's persistent record, so
//! changing a parameter rebuilds exactly the steps that read it.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;

use log::warn;
pub use serde_yaml::Value;

use crate::error::{Error, Result};

/// The default parameter configuration YAML file to load.
pub const DEFAULT_CONFIG: &str = "DynaMake.yaml";

/// Overrides the default persistent state directory (`.dynamake`).
pub const PERSISTENT_DIR_ENV: &str = "DYNAMAKE_PERSISTENT_DIR";

/// Overrides the default `jobs` value (`-1`).
pub const JOBS_ENV: &str = "DYNAMAKE_JOBS";

/// How a parameter's string representation is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Bool,
    Int,
    Float,
    Str,
}

impl ParamKind {
    /// Parse a command-line or configuration string into a typed value.
    pub fn parse(&self, text: &str) -> Option<Value> {
        match self {
            ParamKind::Bool => match text.to_lowercase().as_str() {
                "yes" | "true" | "t" | "y" | "1" => Some(Value::Bool(true)),
                "no" | "false" | "f" | "n" | "0" => Some(Value::Bool(false)),
                _ => None,
            },
            ParamKind::Int => text.parse::<i64>().ok().map(Value::from),
            ParamKind::Float => text.parse::<f64>().ok().map(Value::from),
            ParamKind::Str => Some(Value::String(text.to_owned())),
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match self {
            ParamKind::Bool => value.is_bool(),
            ParamKind::Int => value.is_i64() || value.is_u64(),
            ParamKind::Float => value.is_number(),
            ParamKind::Str => value.is_string(),
        }
    }
}

/// The description of one configurable parameter.
#[derive(Debug, Clone)]
pub struct ParameterDef {
    /// The unique name of the parameter.
    pub name: String,
    /// The unique short command-line name, if any.
    pub short: Option<char>,
    /// How string values are parsed.
    pub kind: ParamKind,
    /// The value used when the parameter is not configured anywhere.
    pub default: Value,
    /// A description for help messages.
    pub description: String,
    /// Registration order, used to keep help output stable.
    pub order: usize,
}

/// All known parameters and their resolved values.
#[derive(Debug, Clone, Default)]
pub struct Params {
    by_name: BTreeMap<String, ParameterDef>,
    values: BTreeMap<String, Value>,
}

impl Params {
    /// Create a store holding the engine's built-in parameters.
    pub fn new() -> Self {
        let mut params = Params::default();
        params.define_builtins();
        params
    }

    fn define_builtins(&mut self) {
        let jobs_default = match env::var(JOBS_ENV) {
            Ok(text) => match text.parse::<i64>() {
                Ok(value) => value,
                Err(_) => {
                    warn!("Ignoring the invalid {JOBS_ENV}: {text}");
                    -1
                }
            },
            Err(_) => -1,
        };
        let persistent_default =
            env::var(PERSISTENT_DIR_ENV).unwrap_or_else(|_| ".dynamake".to_owned());

        let builtins: &[(&str, Option<char>, ParamKind, Value, &str)] = &[
            (
                "jobs",
                Some('j'),
                ParamKind::Int,
                Value::from(jobs_default),
                "The number of jobs to run in parallel. Use 0 for unlimited parallelism, \
                 1 for serial execution, and a negative number for a fraction of the \
                 logical processors in the system (-1 for one per logical processor, \
                 -2 for one per two logical processors, etc.)",
            ),
            (
                "log_level",
                None,
                ParamKind::Str,
                Value::String("WARN".to_owned()),
                "The log level to use (ERROR, WARN, INFO, FILE, WHY, TRACE, DEBUG)",
            ),
            (
                "log_skipped_actions",
                None,
                ParamKind::Bool,
                Value::Bool(false),
                "Whether to log (level INFO) skipped actions",
            ),
            (
                "rebuild_changed_actions",
                None,
                ParamKind::Bool,
                Value::Bool(true),
                "Whether to rebuild outputs if the actions have changed",
            ),
            (
                "persistent_directory",
                None,
                ParamKind::Str,
                Value::String(persistent_default),
                "The directory to keep persistent data in, if rebuild_changed_actions is true",
            ),
            (
                "failure_aborts_build",
                None,
                ParamKind::Bool,
                Value::Bool(true),
                "Whether to stop the build if any action fails",
            ),
            (
                "remove_stale_outputs",
                None,
                ParamKind::Bool,
                Value::Bool(true),
                "Whether to remove old output files before executing an action",
            ),
            (
                "touch_success_outputs",
                None,
                ParamKind::Bool,
                Value::Bool(false),
                "Whether to touch output files on a successful action to ensure they are \
                 newer than the input file(s)",
            ),
            (
                "remove_failed_outputs",
                None,
                ParamKind::Bool,
                Value::Bool(true),
                "Whether to remove output files on a failing action",
            ),
            (
                "remove_empty_directories",
                None,
                ParamKind::Bool,
                Value::Bool(false),
                "Whether to remove empty directories when deleting the last file in them",
            ),
            (
                "wait_nfs_outputs",
                None,
                ParamKind::Bool,
                Value::Bool(false),
                "Whether to wait for NFS outputs to become visible after a successful action",
            ),
            (
                "nfs_outputs_timeout",
                None,
                ParamKind::Int,
                Value::from(60_i64),
                "How many seconds to wait for NFS outputs to become visible",
            ),
            (
                "no_actions",
                Some('n'),
                ParamKind::Bool,
                Value::Bool(false),
                "Dry-run: stop before the first action that would have to run. Note that a \
                 step whose body reads files produced by the skipped action may misbehave; \
                 the engine therefore stops at the first pending action",
            ),
        ];

        for (name, short, kind, default, description) in builtins {
            self.define(name, *short, *kind, default.clone(), description)
                .expect("built-in parameters are distinct");
        }
    }

    /// Register a parameter. Registering the same name twice is a
    /// configuration error.
    pub fn define(
        &mut self,
        name: &str,
        short: Option<char>,
        kind: ParamKind,
        default: Value,
        description: &str,
    ) -> Result<()> {
        if self.by_name.contains_key(name) {
            return Err(Error::Config {
                message: format!("Multiple definitions for the parameter: {name}"),
            });
        }
        let order = self.by_name.len();
        self.by_name.insert(
            name.to_owned(),
            ParameterDef {
                name: name.to_owned(),
                short,
                kind,
                default: default.clone(),
                description: description.to_owned(),
                order,
            },
        );
        self.values.insert(name.to_owned(), default);
        Ok(())
    }

    /// Load a configuration file: a top-level YAML mapping of parameter
    /// names to values. A name suffixed with `?` is silently ignored when
    /// unknown.
    pub fn load_config(&mut self, path: &Path) -> Result<()> {
        let source = path.to_string_lossy().into_owned();
        let content = fs::read_to_string(path)?;
        let data: Value = serde_yaml::from_str(&content)?;
        if data.is_null() {
            return Ok(());
        }
        let mapping = data.as_mapping().ok_or_else(|| Error::Config {
            message: format!("The configuration file: {source} does not contain a top-level mapping"),
        })?;

        for (key, value) in mapping {
            let key = key.as_str().ok_or_else(|| Error::Config {
                message: format!("Non-string parameter name in the configuration file: {source}"),
            })?;
            let (name, is_tolerant) = match key.strip_suffix('?') {
                Some(name) => (name, true),
                None => (key, false),
            };
            if !self.by_name.contains_key(name) {
                if is_tolerant {
                    continue;
                }
                return Err(Error::UnknownParameter {
                    name: name.to_owned(),
                    file: Some(source),
                });
            }
            self.apply(name, value.clone(), Some(&source))?;
        }
        Ok(())
    }

    fn apply(&mut self, name: &str, value: Value, source: Option<&str>) -> Result<()> {
        let definition = &self.by_name[name];
        let value = match &value {
            Value::String(text) if definition.kind != ParamKind::Str => definition
                .kind
                .parse(text)
                .ok_or_else(|| Error::InvalidParameterValue {
                    name: name.to_owned(),
                    value: text.clone(),
                    file: source.map(str::to_owned),
                })?,
            _ if definition.kind.accepts(&value) => value,
            _ => {
                return Err(Error::InvalidParameterValue {
                    name: name.to_owned(),
                    value: serde_yaml::to_string(&value).unwrap_or_default().trim().to_owned(),
                    file: source.map(str::to_owned),
                })
            }
        };
        self.values.insert(name.to_owned(), value);
        Ok(())
    }

    /// Apply an explicit override from a command-line string.
    pub fn override_from(&mut self, name: &str, text: &str) -> Result<()> {
        let definition = self.by_name.get(name).ok_or_else(|| Error::UnknownParameter {
            name: name.to_owned(),
            file: None,
        })?;
        let value = definition
            .kind
            .parse(text)
            .ok_or_else(|| Error::InvalidParameterValue {
                name: name.to_owned(),
                value: text.to_owned(),
                file: None,
            })?;
        self.values.insert(name.to_owned(), value);
        Ok(())
    }

    /// Set a parameter to an already-typed value.
    pub fn set(&mut self, name: &str, value: Value) -> Result<()> {
        if !self.by_name.contains_key(name) {
            return Err(Error::UnknownParameter {
                name: name.to_owned(),
                file: None,
            });
        }
        self.apply(name, value, None)
    }

    /// The resolved value of a parameter, if it is known.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn get_bool(&self, name: &str) -> Result<bool> {
        self.typed(name, Value::as_bool, "boolean")
    }

    pub fn get_i64(&self, name: &str) -> Result<i64> {
        self.typed(name, Value::as_i64, "integer")
    }

    pub fn get_str(&self, name: &str) -> Result<String> {
        self.typed(name, |value| value.as_str().map(str::to_owned), "string")
    }

    fn typed<T>(&self, name: &str, view: impl Fn(&Value) -> Option<T>, kind: &str) -> Result<T> {
        let value = self.values.get(name).ok_or_else(|| Error::UnknownParameter {
            name: name.to_owned(),
            file: None,
        })?;
        view(value).ok_or_else(|| Error::Config {
            message: format!("The parameter: {name} does not hold a {kind} value"),
        })
    }

    /// All parameter definitions, in registration order.
    pub fn definitions(&self) -> Vec<&ParameterDef> {
        let mut definitions: Vec<&ParameterDef> = self.by_name.values().collect();
        definitions.sort_by_key(|definition| definition.order);
        definitions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_defaults() {
        let params = Params::new();
        assert_eq!(params.get_i64("jobs").unwrap(), -1);
        assert!(params.get_bool("failure_aborts_build").unwrap());
        assert!(!params.get_bool("touch_success_outputs").unwrap());
        assert_eq!(params.get_str("persistent_directory").unwrap(), ".dynamake");
    }

    #[test]
    fn test_define_and_override() {
        let mut params = Params::new();
        params
            .define("mode", None, ParamKind::Str, Value::String("release".into()), "build mode")
            .unwrap();
        assert_eq!(params.get_str("mode").unwrap(), "release");

        params.override_from("mode", "debug").unwrap();
        assert_eq!(params.get_str("mode").unwrap(), "debug");

        assert!(params.override_from("missing", "x").is_err());
        assert!(params.override_from("jobs", "lots").is_err());
    }

    #[test]
    fn test_duplicate_definition() {
        let mut params = Params::new();
        let error = params.define("jobs", None, ParamKind::Int, Value::from(1), "dup");
        assert!(error.is_err());
    }

    #[test]
    fn test_load_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("DynaMake.yaml");
        std::fs::write(&path, "jobs: 4\nfailure_aborts_build: false\nsomething_else?: 17\n")
            .unwrap();

        let mut params = Params::new();
        params.load_config(&path).unwrap();
        assert_eq!(params.get_i64("jobs").unwrap(), 4);
        assert!(!params.get_bool("failure_aborts_build").unwrap());
    }

    #[test]
    fn test_load_config_unknown_parameter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("DynaMake.yaml");
        std::fs::write(&path, "no_such_parameter: 1\n").unwrap();

        let mut params = Params::new();
        assert!(matches!(
            params.load_config(&path),
            Err(Error::UnknownParameter { .. })
        ));
    }

    #[test]
    fn test_load_config_string_coercion() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("DynaMake.yaml");
        std::fs::write(&path, "jobs: '8'\nremove_stale_outputs: 'no'\n").unwrap();

        let mut params = Params::new();
        params.load_config(&path).unwrap();
        assert_eq!(params.get_i64("jobs").unwrap(), 8);
        assert!(!params.get_bool("remove_stale_outputs").unwrap());
    }

    #[test]
    fn test_bool_parsing() {
        for text in ["yes", "true", "T", "y", "1"] {
            assert_eq!(ParamKind::Bool.parse(text), Some(Value::Bool(true)));
        }
        for text in ["no", "false", "F", "n", "0"] {
            assert_eq!(ParamKind::Bool.parse(text), Some(Value::Bool(false)));
        }
        assert_eq!(ParamKind::Bool.parse("maybe"), None);
    }
}
