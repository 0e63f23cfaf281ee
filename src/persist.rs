//! # Persistent Action Log
//!
//! Modification times alone cannot detect that a command line changed, that
//! a dependency was added or dropped, or that a parameter was flipped. For
//! that, the engine keeps one human-readable YAML record per step instance
//! under the persistent state directory (`.dynamake` by default), written
//! only when the instance completes successfully.
//!
//! The record holds everything the up-to-date oracle compares on the next
//! run: the resolved required inputs, the resolved outputs, the sub-step
//! instances invoked, the fingerprints of the executed commands, and the
//! parameter values the step read. A missing record means "never built"; a
//! record that fails to parse is treated the same way and is replaced on the
//! next success.
//!
//! Records are written to a temporary file and renamed into place, so a
//! crash or a concurrent reader never observes a half-written record. A
//! failed step leaves its previous record untouched: the last *good* state
//! remains the baseline for future decisions.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::error::Result;

/// The extension of record files, after the step name.
const RECORD_SUFFIX: &str = ".actions.yaml";

/// The identity of a sub-step invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubStepRecord {
    /// The sub-step name.
    pub step: String,
    /// The bindings of the sub-step instance.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// One executed command of the last successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    /// The fingerprint: the argument vector with phony segments removed.
    pub argv: Vec<String>,
    /// When the command started.
    pub start: String,
    /// When the command ended.
    pub end: String,
}

/// The complete record of one step instance's last successful execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// The step name.
    pub step: String,
    /// The bindings extracted from the required path.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// The required input paths, in the order they were first required.
    #[serde(default)]
    pub required: Vec<String>,
    /// The resolved output paths.
    #[serde(default)]
    pub outputs: Vec<String>,
    /// The sub-step instances invoked, in invocation order.
    #[serde(default)]
    pub sub_steps: Vec<SubStepRecord>,
    /// The executed command fingerprints, in execution order.
    #[serde(default)]
    pub actions: Vec<ActionRecord>,
    /// The parameter values the step read, by name.
    #[serde(default)]
    pub config: BTreeMap<String, Value>,
}

impl StepRecord {
    /// An empty record for a fresh step instance.
    pub fn new(step: &str, parameters: &BTreeMap<String, String>) -> Self {
        StepRecord {
            step: step.to_owned(),
            parameters: parameters.clone(),
            required: Vec::new(),
            outputs: Vec::new(),
            sub_steps: Vec::new(),
            actions: Vec::new(),
            config: BTreeMap::new(),
        }
    }
}

/// The outcome of trying to read a step instance's record.
#[derive(Debug)]
pub enum LoadedRecord {
    /// Never built (no record file).
    Missing,
    /// A record file exists but cannot be parsed.
    Corrupt,
    /// The last successful execution's record.
    Record(StepRecord),
}

/// Escape a binding value so it is safe inside a file name.
///
/// Alphanumerics, `.`, `-` and `_` pass through; everything else becomes
/// `%XX`, so distinct values always map to distinct names.
pub fn escape_value(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'-' | b'_' => {
                result.push(byte as char)
            }
            _ => result.push_str(&format!("%{byte:02X}")),
        }
    }
    result
}

/// The `k1=v1&k2=v2` suffix identifying a parameterized step instance, with
/// keys in sorted order and values escaped.
pub fn instance_suffix(parameters: &BTreeMap<String, String>) -> String {
    parameters
        .iter()
        .map(|(name, value)| format!("{}={}", escape_value(name), escape_value(value)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Where the record of a step instance lives.
///
/// Parameterless steps use `<dir>/<step>.actions.yaml`; parameterized ones
/// use `<dir>/<step>/<k1>=<v1>&…&<kn>=<vn>.actions.yaml`.
pub fn record_path(directory: &Path, step: &str, parameters: &BTreeMap<String, String>) -> PathBuf {
    if parameters.is_empty() {
        directory.join(format!("{step}{RECORD_SUFFIX}"))
    } else {
        directory
            .join(step)
            .join(format!("{}{}", instance_suffix(parameters), RECORD_SUFFIX))
    }
}

/// Read the record of a step instance from the state directory.
pub fn load(directory: &Path, step: &str, parameters: &BTreeMap<String, String>) -> LoadedRecord {
    let path = record_path(directory, step, parameters);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(_) => return LoadedRecord::Missing,
    };
    match serde_yaml::from_str::<StepRecord>(&content) {
        Ok(record) => {
            debug!("Read the persistent actions: {}", path.display());
            LoadedRecord::Record(record)
        }
        Err(error) => {
            warn!(
                "Ignoring the invalid persistent actions: {} - {error}",
                path.display()
            );
            LoadedRecord::Corrupt
        }
    }
}

/// Atomically write the record of a successful step instance, replacing any
/// previous one.
pub fn store(directory: &Path, record: &StepRecord) -> Result<()> {
    let path = record_path(directory, &record.step, &record.parameters);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temporary = path.with_extension("tmp");
    fs::write(&temporary, serde_yaml::to_string(record)?)?;
    fs::rename(&temporary, &path)?;
    debug!("Wrote the persistent actions: {}", path.display());
    Ok(())
}

/// The current local time, formatted for the `start`/`end` fields.
pub fn now_string() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S%.9f").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parameters(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn test_escape_value() {
        assert_eq!(escape_value("plain-value_1.0"), "plain-value_1.0");
        assert_eq!(escape_value("a/b"), "a%2Fb");
        assert_eq!(escape_value("a b&c"), "a%20b%26c");
    }

    #[test]
    fn test_record_path() {
        let directory = Path::new(".dynamake");
        assert_eq!(
            record_path(directory, "all", &BTreeMap::new()),
            PathBuf::from(".dynamake/all.actions.yaml")
        );
        assert_eq!(
            record_path(directory, "compile", &parameters(&[("name", "a/b"), ("mode", "x")])),
            PathBuf::from(".dynamake/compile/mode=x&name=a%2Fb.actions.yaml")
        );
    }

    #[test]
    fn test_store_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut record = StepRecord::new("compile", &parameters(&[("name", "a")]));
        record.required.push("src/a.c".to_owned());
        record.outputs.push("obj/a.o".to_owned());
        record.actions.push(ActionRecord {
            argv: vec!["cc".to_owned(), "-c".to_owned(), "src/a.c".to_owned()],
            start: now_string(),
            end: now_string(),
        });
        record
            .config
            .insert("mode".to_owned(), Value::String("release".to_owned()));

        store(dir.path(), &record).unwrap();
        match load(dir.path(), "compile", &record.parameters) {
            LoadedRecord::Record(loaded) => assert_eq!(loaded, record),
            other => panic!("expected a record, got: {other:?}"),
        }
    }

    #[test]
    fn test_load_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load(dir.path(), "compile", &BTreeMap::new()),
            LoadedRecord::Missing
        ));
    }

    #[test]
    fn test_load_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = record_path(dir.path(), "compile", &BTreeMap::new());
        fs::write(&path, "not: [valid").unwrap();
        assert!(matches!(
            load(dir.path(), "compile", &BTreeMap::new()),
            LoadedRecord::Corrupt
        ));
    }

    #[test]
    fn test_store_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let record = StepRecord::new("all", &BTreeMap::new());
        store(dir.path(), &record).unwrap();

        let mut updated = record.clone();
        updated.required.push("foo".to_owned());
        store(dir.path(), &updated).unwrap();

        match load(dir.path(), "all", &BTreeMap::new()) {
            LoadedRecord::Record(loaded) => assert_eq!(loaded.required, vec!["foo"]),
            other => panic!("expected a record, got: {other:?}"),
        }
    }
}
