//! # Up-To-Date Oracle
//!
//! Before each action of a step instance runs, the engine must decide: can
//! this action be skipped, or must it run? The oracle owns that decision.
//! It combines three sources of truth:
//!
//! - the filesystem, through the stat cache: which outputs currently exist
//!   and how their modification times compare to the inputs known so far;
//! - the persistent record of the last successful execution: did the
//!   command line, the required inputs, the sub-steps, the outputs, or the
//!   parameter values change since then;
//! - the annotations: phony outputs always run, `exists`-only paths opt out
//!   of time comparisons.
//!
//! The decision rules short-circuit in a fixed order (phony, no record,
//! record changed, missing output, output older than input). Whenever the
//! oracle decides an action must run it logs the reason under the `why`
//! target, so `--log_level WHY` answers the eternal question of why a build
//! is not incremental.
//!
//! Because inputs and sub-steps are discovered *while the step body runs*,
//! record comparisons are prefix-wise: at the i-th action, the lists
//! accumulated so far must be a prefix of the recorded ones. A step that
//! skipped actions and only later discovers a difference cannot trust its
//! partial state; the executor restarts it from the beginning.

use std::path::Path;

use log::{debug, log_enabled, Level};

use crate::annotations::APath;
use crate::patterns::Pattern;
use crate::persist::{LoadedRecord, StepRecord};
use crate::stat::StatCache;

const WHY: &str = "why";

/// Decides skip-versus-run for one step instance.
#[derive(Debug)]
pub struct Oracle {
    log: String,
    enabled: bool,
    old: Option<StepRecord>,
    must_run: bool,
    phony_output: Option<String>,
    missing_pattern: Option<String>,
    missing_old_output: Option<String>,
    abandoned_output: Option<String>,
    oldest_output: Option<(String, i64)>,
    newest_input: Option<(String, i64)>,
}

impl Oracle {
    /// Create the oracle for a step instance, given the loaded persistent
    /// record. When `enabled` is false (`rebuild_changed_actions` off) the
    /// record rules are disabled entirely and freshness is decided from the
    /// filesystem alone.
    pub fn new(log: &str, enabled: bool, loaded: LoadedRecord, record_path: &Path) -> Oracle {
        let mut oracle = Oracle {
            log: log.to_owned(),
            enabled,
            old: None,
            must_run: false,
            phony_output: None,
            missing_pattern: None,
            missing_old_output: None,
            abandoned_output: None,
            oldest_output: None,
            newest_input: None,
        };
        if !enabled {
            return oracle;
        }
        match loaded {
            LoadedRecord::Record(record) => oracle.old = Some(record),
            LoadedRecord::Missing => {
                debug!(
                    target: WHY,
                    "{} - Must run actions because missing the persistent actions: {}",
                    oracle.log,
                    record_path.display()
                );
                oracle.must_run = true;
            }
            LoadedRecord::Corrupt => {
                debug!(
                    target: WHY,
                    "{} - Must run actions because read the invalid persistent actions: {}",
                    oracle.log,
                    record_path.display()
                );
                oracle.must_run = true;
            }
        }
        oracle
    }

    /// Whether the run decision is already made.
    pub fn must_run(&self) -> bool {
        self.must_run
    }

    /// Whether record comparisons are enabled.
    pub fn record_enabled(&self) -> bool {
        self.enabled
    }

    /// The last successful execution's record, if any.
    pub fn old_record(&self) -> Option<&StepRecord> {
        self.old.as_ref()
    }

    /// Note a phony output: the step's actions always run.
    pub fn note_phony(&mut self, output: &str) {
        if self.phony_output.is_none() {
            self.phony_output = Some(output.to_owned());
        }
    }

    pub fn has_phony(&self) -> bool {
        self.phony_output.is_some()
    }

    /// Digest the initial state of the outputs: which paths each output
    /// pattern currently matches (`initial`), and which non-`optional`
    /// patterns matched nothing (`empty_patterns`). Compares against the
    /// recorded outputs and computes the oldest existing output time.
    pub fn analyze_outputs(
        &mut self,
        initial: &[APath],
        empty_patterns: &[Pattern],
        stat: &mut StatCache,
    ) {
        if let Some(pattern) = empty_patterns.first() {
            self.missing_pattern = Some(pattern.source().as_str().to_owned());
        }

        if let Some(old) = &self.old {
            for path in &old.outputs {
                if initial.iter().any(|known| known.as_str() == path) {
                    continue;
                }
                if empty_patterns
                    .iter()
                    .any(|pattern| pattern.match_path(path).is_some())
                {
                    continue;
                }
                if stat.exists(path) {
                    debug!("{} - Changed to abandon the output: {}", self.log, path);
                    self.abandoned_output = Some(path.clone());
                } else {
                    debug!("{} - Missing the old built output: {}", self.log, path);
                    self.missing_old_output = Some(path.clone());
                }
                stat.forget(path);
            }
        }

        if self.must_run
            || self.phony_output.is_some()
            || self.missing_pattern.is_some()
            || self.missing_old_output.is_some()
            || self.abandoned_output.is_some()
        {
            return;
        }

        for path in initial {
            if path.is_exists() {
                continue;
            }
            let mtime_ns = match stat.try_stat(path.as_str()) {
                Some(found) => found.mtime_ns,
                None => continue,
            };
            let is_older = match &self.oldest_output {
                Some((_, oldest)) => mtime_ns < *oldest,
                None => true,
            };
            if is_older {
                self.oldest_output = Some((path.as_str().to_owned(), mtime_ns));
            }
        }

        if log_enabled!(Level::Debug) {
            if let Some((path, _)) = &self.oldest_output {
                debug!("{} - Oldest output: {}", self.log, path);
            }
        }
    }

    /// Note a synced input and its modification time (phony inputs pass
    /// their synthetic time).
    pub fn note_input(&mut self, path: &str, mtime_ns: i64) {
        let is_newer = match &self.newest_input {
            Some((_, newest)) => mtime_ns > *newest,
            None => true,
        };
        if is_newer {
            self.newest_input = Some((path.to_owned(), mtime_ns));
        }
    }

    /// The newest input seen so far, if any.
    pub fn newest_input(&self) -> Option<(&str, i64)> {
        self.newest_input
            .as_ref()
            .map(|(path, mtime_ns)| (path.as_str(), *mtime_ns))
    }

    /// The synthetic modification time assigned to phony outputs: one
    /// nanosecond past the newest input, so dependents only rebuild when a
    /// real input changed.
    pub fn phony_mtime_ns(&self) -> i64 {
        self.newest_input.as_ref().map(|(_, ns)| *ns).unwrap_or(0) + 1
    }

    /// Reset for a restarted step body: all actions run unconditionally on
    /// the second pass.
    pub fn restart(&mut self) {
        self.must_run = true;
        self.newest_input = None;
        self.oldest_output = None;
        self.abandoned_output = None;
    }

    /// Decide whether the action at `index` (with the given fingerprint)
    /// must run, given everything accumulated in `new` so far. Once true,
    /// the decision is sticky for the rest of the step.
    pub fn should_run(&mut self, index: usize, fingerprint: &[String], new: &StepRecord) -> bool {
        if self.must_run {
            return true;
        }
        if let Some(why) = self.find_reason(index, fingerprint, new) {
            debug!(target: WHY, "{} - Must run actions {}", self.log, why);
            self.must_run = true;
            return true;
        }
        debug!(
            "{} - Can skip actions because all the outputs exist and are newer than all the inputs",
            self.log
        );
        false
    }

    fn find_reason(&self, index: usize, fingerprint: &[String], new: &StepRecord) -> Option<String> {
        if let Some(output) = &self.phony_output {
            return Some(format!("to satisfy the phony output: {output}"));
        }

        if self.enabled {
            if let Some(old) = &self.old {
                if let Some(reason) = Self::changed_record(old, index, fingerprint, new) {
                    return Some(reason);
                }
                if let Some(path) = &self.missing_old_output {
                    return Some(format!("because missing the old built output: {path}"));
                }
                if let Some(path) = &self.abandoned_output {
                    return Some(format!("since it has changed to abandon the output: {path}"));
                }
            }
        }

        if let Some(pattern) = &self.missing_pattern {
            return Some(format!("to create the missing output(s): {pattern}"));
        }

        if let (Some((input, input_ns)), Some((output, output_ns))) =
            (&self.newest_input, &self.oldest_output)
        {
            if input_ns > output_ns {
                return Some(format!(
                    "because the output: {output} is not newer than the input: {input}"
                ));
            }
        }

        None
    }

    fn changed_record(
        old: &StepRecord,
        index: usize,
        fingerprint: &[String],
        new: &StepRecord,
    ) -> Option<String> {
        if new.required.len() > old.required.len() {
            return Some(format!(
                "because it has changed to require: {}",
                new.required[old.required.len()]
            ));
        }
        for (position, path) in new.required.iter().enumerate() {
            if old.required[position] != *path {
                return Some(format!(
                    "because it has changed to require: {} instead of: {}",
                    path, old.required[position]
                ));
            }
        }

        if new.sub_steps.len() > old.sub_steps.len() {
            return Some(format!(
                "because it has changed to invoke the step: {}",
                new.sub_steps[old.sub_steps.len()].step
            ));
        }
        for (position, sub_step) in new.sub_steps.iter().enumerate() {
            if old.sub_steps[position] != *sub_step {
                return Some(format!(
                    "because it has changed to invoke the step: {} instead of: {}",
                    sub_step.step, old.sub_steps[position].step
                ));
            }
        }

        if index >= old.actions.len() {
            return Some("since it has changed to add action(s)".to_owned());
        }
        if old.actions[index].argv != fingerprint {
            return Some(format!(
                "because it has changed the command: {} into the command: {}",
                old.actions[index].argv.join(" "),
                fingerprint.join(" ")
            ));
        }

        for (name, value) in &new.config {
            match old.config.get(name) {
                None => {
                    return Some(format!(
                        "because it has changed to read the parameter: {name}"
                    ))
                }
                Some(old_value) if old_value != value => {
                    return Some(format!(
                        "because it has changed the value of the parameter: {name}"
                    ))
                }
                Some(_) => {}
            }
        }

        None
    }

    /// After a step completes having skipped all its actions, verify that
    /// the final accumulated lists still agree with the record. A mismatch
    /// means the step changed in a way the skipped actions never observed;
    /// the previous record is kept and the caller logs the returned warning.
    pub fn completion_warning(&self, new: &StepRecord, considered: usize) -> Option<String> {
        let old = self.old.as_ref()?;
        if considered < old.actions.len() {
            return Some(
                "Skipped some action(s) even though it has changed to remove some final action(s)"
                    .to_owned(),
            );
        }
        if new.required != old.required {
            return Some(
                "Skipped some action(s) even though the required inputs have changed".to_owned(),
            );
        }
        if new.sub_steps != old.sub_steps {
            return Some(
                "Skipped some action(s) even though the invoked steps have changed".to_owned(),
            );
        }
        if new.config != old.config {
            return Some(
                "Skipped some action(s) even though the read parameters have changed".to_owned(),
            );
        }
        None
    }
}
