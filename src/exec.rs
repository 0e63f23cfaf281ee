//! # Step Executor
//!
//! The executor drives the whole build. Steps are registered on a [`Make`]
//! builder; [`Make::build`] resolves the requested targets to step
//! instances and runs them.
//!
//! ## Execution model
//!
//! Each step instance runs on its own thread, but all engine state (the
//! stat cache, the up-to-date map, resource counters, instance results)
//! lives behind one mutex: step bodies only interleave at the engine calls
//! they make, and hold no engine state across them. The real parallelism
//! comes from external actions: the engine lock is released while a child
//! process runs, so as many commands execute concurrently as the resource
//! budget admits.
//!
//! - [`StepContext::require`] resolves a path to the step instance that
//!   produces it, starts that instance if it is not already running, and
//!   returns immediately.
//! - [`StepContext::sync`] blocks until every requirement issued so far
//!   reached a terminal state, and fails the caller if a non-`optional`
//!   requirement failed.
//! - [`StepContext::shell`] / [`StepContext::spawn`] imply a `sync`, ask
//!   the oracle whether the action can be skipped, reserve resources, and
//!   run the command.
//!
//! A step that skipped earlier actions and then hits one that must run is
//! restarted from the beginning (its body runs again with every action
//! forced), which is why step bodies must be idempotent.
//!
//! ## Failure policy
//!
//! With `failure_aborts_build` (the default) the first failure stops the
//! build: running actions finish, no new actions start, and blocked `sync`s
//! are woken with a failure. With it off, only the steps that depend on the
//! failed output fail; independent branches keep building.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, error, info, log_enabled, warn, Level};
use serde_yaml::Value;

use crate::action::{self, Kind};
use crate::annotations::{clean_path, APath};
use crate::error::{Error, Result};
use crate::oracle::Oracle;
use crate::params::{ParamKind, Params};
use crate::patterns::{self, Bindings, Captured, Pattern};
use crate::persist::{self, ActionRecord, LoadedRecord, StepRecord, SubStepRecord};
use crate::registry::{Registry, StepBody, StepConfig, StepDef};
use crate::stat::{self, StatCache};

const TRACE: &str = "trace";
const FILE: &str = "file";

/// What happened during a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildReport {
    /// How many external actions were executed.
    pub actions: usize,
    /// How many external actions were skipped as up-to-date.
    pub skipped: usize,
    /// Whether a `no_actions` dry run stopped at a pending action.
    pub dry_stopped: bool,
}

/// The engine parameters, snapshotted at the start of a build.
#[derive(Debug, Clone)]
struct Options {
    jobs: i64,
    rebuild_changed_actions: bool,
    failure_aborts_build: bool,
    remove_stale_outputs: bool,
    remove_failed_outputs: bool,
    remove_empty_directories: bool,
    touch_success_outputs: bool,
    wait_nfs_outputs: bool,
    nfs_outputs_timeout: i64,
    log_skipped_actions: bool,
    no_actions: bool,
    persistent_directory: PathBuf,
}

impl Options {
    fn from_params(params: &Params) -> Result<Options> {
        let raw_jobs = params.get_i64("jobs")?;
        let jobs = if raw_jobs < 0 {
            let processors = std::thread::available_parallelism()
                .map(|count| count.get() as i64)
                .unwrap_or(1);
            (processors / -raw_jobs).max(1)
        } else {
            raw_jobs
        };
        Ok(Options {
            jobs,
            rebuild_changed_actions: params.get_bool("rebuild_changed_actions")?,
            failure_aborts_build: params.get_bool("failure_aborts_build")?,
            remove_stale_outputs: params.get_bool("remove_stale_outputs")?,
            remove_failed_outputs: params.get_bool("remove_failed_outputs")?,
            remove_empty_directories: params.get_bool("remove_empty_directories")?,
            touch_success_outputs: params.get_bool("touch_success_outputs")?,
            wait_nfs_outputs: params.get_bool("wait_nfs_outputs")?,
            nfs_outputs_timeout: params.get_i64("nfs_outputs_timeout")?,
            log_skipped_actions: params.get_bool("log_skipped_actions")?,
            no_actions: params.get_bool("no_actions")?,
            persistent_directory: PathBuf::from(params.get_str("persistent_directory")?),
        })
    }
}

/// The origin and time of a target that was built or proved up-to-date.
#[derive(Debug, Clone)]
struct UpToDate {
    /// The step instance that produced the target, or `None` for a source
    /// file. Kept as name plus bindings so later requirers can record the
    /// producer relationship even when the producer already finished.
    producer: Option<SubStepRecord>,
    /// The modification time in nanoseconds (synthetic for phony targets).
    mtime_ns: i64,
}

#[derive(Debug, Clone, Copy)]
enum InstanceState {
    Running,
    Done { success: bool },
}

struct EngineState {
    stat: StatCache,
    up_to_date: HashMap<String, UpToDate>,
    phony: HashSet<String>,
    poisoned: HashSet<String>,
    instances: HashMap<String, InstanceState>,
    res_total: BTreeMap<String, i64>,
    res_available: BTreeMap<String, i64>,
    res_default: BTreeMap<String, i64>,
    actions_count: usize,
    skipped_count: usize,
    /// No new actions may start.
    aborting: bool,
    /// A real failure happened (as opposed to a dry-run stop).
    hard_failed: bool,
    dry_stopped: bool,
    first_failure: Option<String>,
    config_error: Option<String>,
    threads: Vec<JoinHandle<()>>,
}

struct Engine {
    registry: Arc<Registry>,
    params: Params,
    opts: Options,
    state: Mutex<EngineState>,
    completed: Condvar,
    resources: Condvar,
}

impl Engine {
    fn lock(&self) -> Result<MutexGuard<'_, EngineState>> {
        self.state.lock().map_err(|_| Error::Lock {
            context: "engine state".to_owned(),
        })
    }

    fn wait_completed<'a>(
        &self,
        guard: MutexGuard<'a, EngineState>,
    ) -> Result<MutexGuard<'a, EngineState>> {
        self.completed.wait(guard).map_err(|_| Error::Lock {
            context: "completion condition".to_owned(),
        })
    }

    fn wait_resources<'a>(
        &self,
        guard: MutexGuard<'a, EngineState>,
    ) -> Result<MutexGuard<'a, EngineState>> {
        self.resources.wait(guard).map_err(|_| Error::Lock {
            context: "resources condition".to_owned(),
        })
    }

    fn note_failure(&self, state: &mut EngineState, identity: &str, error: &Error) {
        match error {
            Error::DryRun => {
                state.dry_stopped = true;
                state.aborting = true;
            }
            error if error.is_configuration() => {
                state.hard_failed = true;
                state.aborting = true;
                if state.config_error.is_none() {
                    state.config_error = Some(error.to_string());
                }
            }
            _ => {
                state.hard_failed = true;
                if self.opts.failure_aborts_build {
                    state.aborting = true;
                }
            }
        }
        if state.first_failure.is_none() && !matches!(error, Error::DryRun) {
            state.first_failure = Some(identity.to_owned());
        }
    }
}

fn amounts_string(amounts: &BTreeMap<String, i64>) -> String {
    amounts
        .iter()
        .map(|(name, amount)| format!("{name}={amount}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn identity_of(name: &str, bindings: &Bindings) -> String {
    if bindings.is_empty() {
        name.to_owned()
    } else {
        format!("{}/{}", name, persist::instance_suffix(bindings))
    }
}

/// One resolved output pattern of a step instance: concrete or dynamic for
/// real files, `None` pattern for phony targets.
#[derive(Clone)]
struct FormattedOutput {
    path: APath,
    pattern: Option<Pattern>,
}

/// An active invocation of a build step (or the top-level targets).
struct Invocation {
    engine: Arc<Engine>,
    step: Option<usize>,
    bindings: Bindings,
    identity: String,
    log: String,
    chain: Vec<String>,
    required: Vec<APath>,
    wait_for: Vec<String>,
    oracle: Option<Oracle>,
    record: StepRecord,
    formatted: Vec<FormattedOutput>,
    initial_outputs: Vec<APath>,
    built_outputs: Vec<APath>,
    failure: Option<String>,
    action_index: usize,
    must_remove_stale: bool,
    did_skip: bool,
    did_run: bool,
}

impl Invocation {
    fn top(engine: Arc<Engine>) -> Invocation {
        Invocation {
            engine,
            step: None,
            bindings: Bindings::new(),
            identity: "make".to_owned(),
            log: "make".to_owned(),
            chain: Vec::new(),
            required: Vec::new(),
            wait_for: Vec::new(),
            oracle: None,
            record: StepRecord::new("make", &Bindings::new()),
            formatted: Vec::new(),
            initial_outputs: Vec::new(),
            built_outputs: Vec::new(),
            failure: None,
            action_index: 0,
            must_remove_stale: false,
            did_skip: false,
            did_run: false,
        }
    }

    fn new(
        engine: Arc<Engine>,
        step: usize,
        bindings: Bindings,
        identity: String,
        chain: Vec<String>,
    ) -> Invocation {
        let name = engine.registry.get(step).name().to_owned();
        let must_remove_stale = engine.opts.remove_stale_outputs;
        let record = StepRecord::new(&name, &bindings);
        Invocation {
            engine,
            step: Some(step),
            bindings,
            log: identity.clone(),
            identity,
            chain,
            required: Vec::new(),
            wait_for: Vec::new(),
            oracle: None,
            record,
            formatted: Vec::new(),
            initial_outputs: Vec::new(),
            built_outputs: Vec::new(),
            failure: None,
            action_index: 0,
            must_remove_stale,
            did_skip: false,
            did_run: false,
        }
    }

    /// Run a spawned step instance to completion and publish the result.
    fn run(&mut self) {
        debug!(target: TRACE, "{} - Call", self.log);
        match self.execute() {
            Ok(()) => {
                if self.did_run {
                    debug!(target: TRACE, "{} - Done", self.log);
                } else if self.did_skip {
                    debug!(target: TRACE, "{} - Skipped", self.log);
                } else {
                    debug!(target: TRACE, "{} - Complete", self.log);
                }
                self.mark_done(true);
            }
            Err(Error::DryRun) => {
                self.poison_outputs(false);
                self.mark_done(false);
            }
            Err(error) => {
                if self.failure.is_none() {
                    // The error did not pass through abort(), so it was not
                    // logged or recorded yet.
                    error!("{} - {}", self.log, error);
                    self.failure = Some(error.to_string());
                    if let Ok(mut state) = self.engine.lock() {
                        let engine = self.engine.clone();
                        engine.note_failure(&mut state, &self.identity, &error);
                    }
                }
                self.poison_outputs(true);
                debug!(target: TRACE, "{} - Fail", self.log);
                self.mark_done(false);
            }
        }
    }

    fn execute(&mut self) -> Result<()> {
        let step_index = match self.step {
            Some(index) => index,
            None => return Ok(()),
        };

        let opts = &self.engine.opts;
        let name = self.engine.registry.get(step_index).name().to_owned();
        let record_path =
            persist::record_path(&opts.persistent_directory, &name, &self.bindings);
        let loaded = if opts.rebuild_changed_actions {
            persist::load(&opts.persistent_directory, &name, &self.bindings)
        } else {
            LoadedRecord::Missing
        };
        self.oracle = Some(Oracle::new(
            &self.log,
            opts.rebuild_changed_actions,
            loaded,
            &record_path,
        ));

        self.collect_initial_outputs(step_index)?;

        let engine = self.engine.clone();
        let body = &engine.registry.get(step_index).body;
        let mut result = self.call_body(body);
        if matches!(result, Err(Error::Restart)) {
            self.restart();
            result = self.call_body(body);
        }
        result?;
        self.sync()?;
        if self.failure.is_some() {
            return Err(Error::StepFailed {
                step: self.identity.clone(),
            });
        }
        self.collect_final_outputs()?;
        if self.failure.is_some() {
            return Err(Error::StepFailed {
                step: self.identity.clone(),
            });
        }
        self.finish_record()
    }

    fn call_body(&mut self, body: &StepBody) -> Result<()> {
        let mut context = StepContext { invocation: self };
        match catch_unwind(AssertUnwindSafe(|| body(&mut context))) {
            Ok(result) => result,
            Err(_) => Err(Error::Config {
                message: format!("The step: {} panicked", self.identity),
            }),
        }
    }

    /// Reset for a second pass after a skipped action turned out to need a
    /// rerun; every action runs unconditionally this time.
    fn restart(&mut self) {
        debug!("{} - Restart the step to run skipped action(s)", self.log);
        let name = self.record.step.clone();
        self.record = StepRecord::new(&name, &self.bindings);
        self.required.clear();
        self.built_outputs.clear();
        self.action_index = 0;
        self.did_skip = false;
        if let Some(oracle) = &mut self.oracle {
            oracle.restart();
        }
    }

    /// Record a failure. The failure is logged, noted engine-wide, and
    /// returned as an error when the build mode calls for aborting; in
    /// continue mode the caller proceeds but the step stays failed.
    fn abort(&mut self, error: Error) -> Result<()> {
        if self.failure.is_none() {
            error!("{} - {}", self.log, error);
        } else {
            debug!("{} - {}", self.log, error);
        }
        if self.failure.is_none() {
            self.failure = Some(error.to_string());
        }
        let engine = self.engine.clone();
        {
            let mut state = engine.lock()?;
            engine.note_failure(&mut state, &self.identity, &error);
        }
        if engine.opts.failure_aborts_build || error.is_configuration() {
            Err(error)
        } else {
            Ok(())
        }
    }

    fn mark_done(&mut self, success: bool) {
        if let Ok(mut state) = self.engine.lock() {
            state
                .instances
                .insert(self.identity.clone(), InstanceState::Done { success });
        }
        self.engine.completed.notify_all();
        self.engine.resources.notify_all();
    }

    fn record_required(&mut self, path: &APath) {
        if !self
            .record
            .required
            .iter()
            .any(|known| known == path.as_str())
        {
            self.record.required.push(path.as_str().to_owned());
        }
    }

    fn record_sub_step(&mut self, name: &str, bindings: &Bindings) {
        let sub_step = SubStepRecord {
            step: name.to_owned(),
            parameters: bindings.clone(),
        };
        if !self.record.sub_steps.contains(&sub_step) {
            self.record.sub_steps.push(sub_step);
        }
    }

    /// Queue a required path: resolve its producer and start it if needed.
    /// Does not block.
    fn require(&mut self, path: APath) -> Result<()> {
        let path = match clean_path(path) {
            Ok(path) => path,
            Err(error) => return self.abort(error),
        };
        debug!("{} - Build the required: {}", self.log, path);
        self.required.push(path.clone());

        let engine = self.engine.clone();
        let mut state = engine.lock()?;

        if state.poisoned.contains(path.as_str()) {
            drop(state);
            return self.abort(Error::RequiredFailed {
                path: path.as_str().to_owned(),
            });
        }

        if let Some(up_to_date) = state.up_to_date.get(path.as_str()) {
            debug!("{} - The required: {} was built", self.log, path);
            let producer = up_to_date.producer.clone();
            drop(state);
            self.record_required(&path);
            if let Some(producer) = producer {
                self.record_sub_step(&producer.step, &producer.parameters);
            }
            return Ok(());
        }

        let resolved = match engine.registry.producer_of(path.as_str()) {
            Ok(resolved) => resolved,
            Err(error) => {
                drop(state);
                return self.abort(error);
            }
        };

        let (step_index, bindings) = match resolved {
            None => {
                return match state.stat.try_stat(path.as_str()) {
                    Some(found) => {
                        debug!("{} - The required: {} is a source file", self.log, path);
                        state.up_to_date.insert(
                            path.as_str().to_owned(),
                            UpToDate {
                                producer: None,
                                mtime_ns: found.mtime_ns,
                            },
                        );
                        drop(state);
                        self.record_required(&path);
                        Ok(())
                    }
                    None if path.is_optional() => {
                        debug!(
                            "{} - The optional required: {} does not exist and can't be built",
                            self.log, path
                        );
                        Ok(())
                    }
                    None => {
                        drop(state);
                        self.abort(Error::NoRule {
                            path: path.as_str().to_owned(),
                        })
                    }
                };
            }
            Some(resolved) => resolved,
        };

        let name = engine.registry.get(step_index).name().to_owned();
        let identity = identity_of(&name, &bindings);

        if identity == self.identity || self.chain.contains(&identity) {
            let mut chain = self.chain.clone();
            chain.push(self.identity.clone());
            chain.push(identity);
            drop(state);
            return self.abort(Error::CyclicRequire {
                chain: chain.join(" -> "),
            });
        }

        self.record_required(&path);
        self.record_sub_step(&name, &bindings);

        if state.instances.contains_key(&identity) {
            debug!(
                "{} - The required: {} is being produced by: {}",
                self.log, path, identity
            );
        } else {
            debug!(
                "{} - The required: {} will be produced by the spawned: {}",
                self.log, path, identity
            );
            state
                .instances
                .insert(identity.clone(), InstanceState::Running);
            let spawned_engine = self.engine.clone();
            let spawned_identity = identity.clone();
            let mut spawned_chain = self.chain.clone();
            spawned_chain.push(self.identity.clone());
            let handle = std::thread::spawn(move || {
                let mut invocation = Invocation::new(
                    spawned_engine,
                    step_index,
                    bindings,
                    spawned_identity,
                    spawned_chain,
                );
                invocation.run();
            });
            state.threads.push(handle);
        }
        self.wait_for.push(identity);
        Ok(())
    }

    /// Wait until every queued requirement reached a terminal state; fail
    /// if a non-`optional` requirement failed to build. Tracks the newest
    /// input time for the oracle.
    fn sync(&mut self) -> Result<()> {
        let wait = std::mem::take(&mut self.wait_for);
        let engine = self.engine.clone();
        let mut state = engine.lock()?;

        if !wait.is_empty() {
            debug!("{} - Sync", self.log);
        }
        loop {
            let pending = wait
                .iter()
                .any(|identity| matches!(state.instances.get(identity), Some(InstanceState::Running)));
            if !pending {
                break;
            }
            state = engine.wait_completed(state)?;
        }
        debug!("{} - Synced", self.log);

        let mut sorted: Vec<APath> = self.required.clone();
        sorted.sort_by(|left, right| left.as_str().cmp(right.as_str()));

        let mut failed_inputs = false;
        for path in &sorted {
            let poisoned = state.poisoned.contains(path.as_str());
            let known = state.up_to_date.contains_key(path.as_str());
            if poisoned || (!path.is_optional() && !known) {
                let quiet = self.failure.is_some() || (state.dry_stopped && !state.hard_failed);
                if quiet {
                    debug!("{} - The required: {} has failed to build", self.log, path);
                } else {
                    error!("{} - The required: {} has failed to build", self.log, path);
                }
                state.poisoned.insert(path.as_str().to_owned());
                failed_inputs = true;
                continue;
            }
            if !known {
                continue;
            }
            debug!("{} - Has the required: {}", self.log, path);
            if path.is_exists() {
                continue;
            }
            let mtime_ns = if state.phony.contains(path.as_str()) {
                match state.up_to_date.get(path.as_str()) {
                    Some(up_to_date) => up_to_date.mtime_ns,
                    None => continue,
                }
            } else {
                match state.stat.stat(path.as_str()) {
                    Ok(found) => found.mtime_ns,
                    Err(_) => {
                        error!("{} - The required: {} has failed to build", self.log, path);
                        state.poisoned.insert(path.as_str().to_owned());
                        failed_inputs = true;
                        continue;
                    }
                }
            };
            if let Some(oracle) = &mut self.oracle {
                oracle.note_input(path.as_str(), mtime_ns);
            }
        }

        if failed_inputs {
            let dry = state.dry_stopped && !state.hard_failed;
            drop(state);
            if dry {
                return Err(Error::DryRun);
            }
            return self.abort(Error::SyncFailed {
                step: self.identity.clone(),
            });
        }
        Ok(())
    }

    fn collect_initial_outputs(&mut self, step_index: usize) -> Result<()> {
        let engine = self.engine.clone();
        let step = engine.registry.get(step_index);
        let mut state = engine.lock()?;
        let mut empty_patterns: Vec<Pattern> = Vec::new();

        for pattern in step.outputs() {
            let resolved = match patterns::fmt_capture(&self.bindings, pattern.source()) {
                Ok(resolved) => resolved,
                Err(error) => {
                    drop(state);
                    return self.abort(error);
                }
            };

            if resolved.is_phony() {
                state.phony.insert(resolved.as_str().to_owned());
                if let Some(oracle) = &mut self.oracle {
                    oracle.note_phony(resolved.as_str());
                }
                self.formatted.push(FormattedOutput {
                    path: resolved,
                    pattern: None,
                });
                continue;
            }

            let compiled = match Pattern::new(resolved.clone()) {
                Ok(compiled) => compiled,
                Err(error) => {
                    drop(state);
                    return self.abort(error);
                }
            };
            let found = compiled.glob(&mut state.stat)?;
            if found.is_empty() {
                if resolved.is_optional() {
                    debug!("{} - Nonexistent optional output(s): {}", self.log, resolved);
                } else {
                    debug!("{} - Nonexistent required output(s): {}", self.log, resolved);
                    empty_patterns.push(compiled.clone());
                }
            } else {
                for (path, _) in &found {
                    debug!("{} - Existing output: {}", self.log, path);
                    self.initial_outputs.push(path.clone());
                }
            }
            self.formatted.push(FormattedOutput {
                path: resolved,
                pattern: Some(compiled),
            });
        }

        if let Some(oracle) = &mut self.oracle {
            oracle.analyze_outputs(&self.initial_outputs, &empty_patterns, &mut state.stat);
        }
        Ok(())
    }

    /// Run one external action, or skip it when the oracle allows.
    fn run_action(
        &mut self,
        kind: Kind,
        command: Vec<APath>,
        resources: &[(String, i64)],
    ) -> Result<()> {
        self.sync()?;

        let mut argv = command;
        let mut silent = false;
        if let Some(first) = argv.first().cloned() {
            if first.as_str() == "@" {
                silent = true;
                argv.remove(0);
            } else if let Some(rest) = first.as_str().strip_prefix('@') {
                silent = true;
                argv[0] = first.copy_annotations_to(rest.to_owned());
            }
        }
        if argv.is_empty() {
            return self.abort(Error::Config {
                message: "Cannot run an empty command".to_owned(),
            });
        }

        let fingerprint: Vec<String> = argv
            .iter()
            .filter(|word| !word.is_phony())
            .map(|word| word.as_str().to_owned())
            .collect();
        let display = action::render_command(kind, &argv);

        if self.failure.is_some() {
            debug!("{} - Can't run: {}", self.log, display);
            return Err(Error::StepFailed {
                step: self.identity.clone(),
            });
        }
        {
            let state = self.engine.lock()?;
            if state.aborting {
                let dry = state.dry_stopped && !state.hard_failed;
                drop(state);
                debug!("{} - Can't run: {}", self.log, display);
                return Err(if dry {
                    Error::DryRun
                } else {
                    Error::StepFailed {
                        step: self.identity.clone(),
                    }
                });
            }
        }

        let index = self.action_index;
        self.action_index += 1;
        let should_run = match &mut self.oracle {
            Some(oracle) => oracle.should_run(index, &fingerprint, &self.record),
            None => true,
        };
        if !should_run {
            if self.engine.opts.log_skipped_actions && !silent {
                info!("{} - Skip: {}", self.log, display);
            } else {
                debug!("{} - Skip: {}", self.log, display);
            }
            self.did_skip = true;
            self.engine.lock()?.skipped_count += 1;
            return Ok(());
        }
        if self.did_skip {
            debug!("{} - Must restart step to run skipped action(s)", self.log);
            return Err(Error::Restart);
        }
        self.did_run = true;

        if self.engine.opts.no_actions {
            info!("{} - Would run: {}", self.log, display);
            let engine = self.engine.clone();
            {
                let mut state = engine.lock()?;
                state.dry_stopped = true;
                state.aborting = true;
            }
            engine.completed.notify_all();
            engine.resources.notify_all();
            return Err(Error::DryRun);
        }

        self.engine.lock()?.actions_count += 1;

        let amounts = self.effective_resources(resources)?;
        self.admit(&amounts)?;
        let result = self.run_admitted(kind, &argv, fingerprint, &display, silent);
        self.release(&amounts)?;
        result
    }

    fn run_admitted(
        &mut self,
        kind: Kind,
        argv: &[APath],
        fingerprint: Vec<String>,
        display: &str,
        silent: bool,
    ) -> Result<()> {
        {
            let engine = self.engine.clone();
            let mut state = engine.lock()?;
            self.remove_stale_outputs(&mut state);
        }

        if silent {
            debug!("{} - Run: {}", self.log, display);
        } else {
            info!("{} - Run: {}", self.log, display);
        }

        let start = persist::now_string();
        let launched = match action::launch(kind, argv, &self.log) {
            Ok(launched) => launched,
            Err(error) => return self.abort(error),
        };
        let status = launched.wait();
        let end = persist::now_string();

        {
            let engine = self.engine.clone();
            let mut state = engine.lock()?;
            for path in &self.initial_outputs {
                state.stat.forget(path.as_str());
            }
            for output in &self.formatted {
                state.stat.forget(output.path.as_str());
            }
        }

        self.record.actions.push(ActionRecord {
            argv: fingerprint,
            start,
            end,
        });

        let status = match status {
            Ok(status) => status,
            Err(error) => return self.abort(error),
        };
        if !status.success() {
            return self.abort(Error::ActionFailed {
                command: display.to_owned(),
            });
        }
        debug!(target: TRACE, "{} - Success: {}", self.log, display);
        Ok(())
    }

    /// Resolve the resource amounts an action needs: explicit requests,
    /// then the step's declared defaults, then the engine-wide per-action
    /// defaults.
    fn effective_resources(
        &mut self,
        requested: &[(String, i64)],
    ) -> Result<BTreeMap<String, i64>> {
        let engine = self.engine.clone();
        let mut merged: BTreeMap<String, i64> = requested.iter().cloned().collect();
        if let Some(step_index) = self.step {
            for (name, amount) in &engine.registry.get(step_index).resources {
                merged.entry(name.clone()).or_insert(*amount);
            }
        }

        let state = engine.lock()?;
        let mut amounts: BTreeMap<String, i64> = BTreeMap::new();
        for (name, amount) in &merged {
            let total = match state.res_total.get(name) {
                Some(total) => *total,
                None => {
                    drop(state);
                    return self
                        .abort(Error::Config {
                            message: format!("Requested the unknown resource: {name}"),
                        })
                        .and(Err(Error::StepFailed {
                            step: self.identity.clone(),
                        }));
                }
            };
            if *amount == 0 || total == 0 {
                continue;
            }
            if *amount > total {
                drop(state);
                return self
                    .abort(Error::Config {
                        message: format!(
                            "The requested resource: {name} amount: {amount} \
                             is greater than the total amount: {total}"
                        ),
                    })
                    .and(Err(Error::StepFailed {
                        step: self.identity.clone(),
                    }));
            }
            amounts.insert(name.clone(), *amount);
        }
        for (name, total) in &state.res_total {
            if merged.contains_key(name) || *total <= 0 {
                continue;
            }
            let amount = state.res_default.get(name).copied().unwrap_or(0);
            if amount > 0 {
                amounts.insert(name.clone(), amount);
            }
        }
        Ok(amounts)
    }

    /// Wait for and grab the resource amounts, first-come first-served per
    /// resource.
    fn admit(&self, amounts: &BTreeMap<String, i64>) -> Result<()> {
        if amounts.is_empty() {
            return Ok(());
        }
        let engine = self.engine.clone();
        let mut state = engine.lock()?;
        loop {
            if state.aborting {
                let dry = state.dry_stopped && !state.hard_failed;
                return Err(if dry {
                    Error::DryRun
                } else {
                    Error::StepFailed {
                        step: self.identity.clone(),
                    }
                });
            }
            let available = amounts
                .iter()
                .all(|(name, amount)| state.res_available.get(name).copied().unwrap_or(0) >= *amount);
            if available {
                for (name, amount) in amounts {
                    if let Some(left) = state.res_available.get_mut(name) {
                        *left -= amount;
                    }
                }
                if log_enabled!(Level::Debug) {
                    debug!("{} - Grab resources: {}", self.log, amounts_string(amounts));
                    debug!(
                        "{} - Available resources: {}",
                        self.log,
                        amounts_string(&state.res_available)
                    );
                }
                return Ok(());
            }
            if log_enabled!(Level::Debug) {
                debug!(
                    "{} - Paused by waiting for resources: {}",
                    self.log,
                    amounts_string(amounts)
                );
            }
            state = engine.wait_resources(state)?;
        }
    }

    fn release(&self, amounts: &BTreeMap<String, i64>) -> Result<()> {
        if amounts.is_empty() {
            return Ok(());
        }
        let engine = self.engine.clone();
        {
            let mut state = engine.lock()?;
            for (name, amount) in amounts {
                if let Some(left) = state.res_available.get_mut(name) {
                    *left += amount;
                }
            }
            if log_enabled!(Level::Debug) {
                debug!("{} - Free resources: {}", self.log, amounts_string(amounts));
            }
        }
        engine.resources.notify_all();
        Ok(())
    }

    /// Delete stale outputs before the first action of the step runs.
    fn remove_stale_outputs(&mut self, state: &mut EngineState) {
        let mut sorted: Vec<APath> = self.initial_outputs.clone();
        sorted.sort_by(|left, right| left.as_str().cmp(right.as_str()));
        for path in &sorted {
            if self.must_remove_stale && !path.is_precious() {
                debug!(target: FILE, "{} - Remove the stale output: {}", self.log, path);
                self.remove_output(state, path.as_str());
            } else {
                state.stat.forget(path.as_str());
            }
        }
        self.must_remove_stale = false;
    }

    /// Remove an output file, and possibly the directories that became
    /// empty as a result.
    fn remove_output(&self, state: &mut EngineState, path: &str) {
        let _ = state.stat.remove(path);
        if !self.engine.opts.remove_empty_directories {
            return;
        }
        let mut current = path;
        while let Some(index) = current.rfind('/') {
            let parent = &current[..index];
            if parent.is_empty() || state.stat.rmdir(parent).is_err() {
                break;
            }
            current = parent;
        }
    }

    /// Verify all non-`optional` outputs were created, register them as
    /// up-to-date, and give phony targets their synthetic time.
    fn collect_final_outputs(&mut self) -> Result<()> {
        let engine = self.engine.clone();
        let outputs = self.formatted.clone();
        let producer = SubStepRecord {
            step: self.record.step.clone(),
            parameters: self.bindings.clone(),
        };
        let mut missing: Option<String> = None;
        let mut state = engine.lock()?;

        for output in &outputs {
            let pattern = match &output.pattern {
                None => {
                    let mtime_ns = self
                        .oracle
                        .as_ref()
                        .map(|oracle| oracle.phony_mtime_ns())
                        .unwrap_or(1);
                    state.up_to_date.insert(
                        output.path.as_str().to_owned(),
                        UpToDate {
                            producer: Some(producer.clone()),
                            mtime_ns,
                        },
                    );
                    continue;
                }
                Some(pattern) => pattern,
            };

            let mut found = pattern.glob(&mut state.stat)?;
            if found.is_empty() && !output.path.is_optional() && engine.opts.wait_nfs_outputs {
                let deadline = Instant::now()
                    + Duration::from_secs(engine.opts.nfs_outputs_timeout.max(0) as u64);
                while found.is_empty() && Instant::now() < deadline {
                    drop(state);
                    std::thread::sleep(Duration::from_secs(1));
                    state = engine.lock()?;
                    found = pattern.glob(&mut state.stat)?;
                }
            }

            if found.is_empty() {
                if output.path.is_optional() {
                    debug!(
                        "{} - Did not make the optional output(s): {}",
                        self.log, output.path
                    );
                    continue;
                }
                error!("{} - Missing the output(s): {}", self.log, output.path);
                missing = Some(output.path.as_str().to_owned());
                break;
            }

            for (path, _) in found {
                if engine.opts.touch_success_outputs && !path.is_exists() && self.did_run {
                    let newest = self
                        .oracle
                        .as_ref()
                        .and_then(|oracle| oracle.newest_input())
                        .map(|(_, mtime_ns)| mtime_ns)
                        .unwrap_or(0);
                    let target = stat::now_nanoseconds().max(newest + 1);
                    debug!(target: FILE, "{} - Touch the output: {}", self.log, path);
                    state.stat.touch(path.as_str(), target)?;
                }
                let found_stat = state.stat.stat(path.as_str())?;
                debug!("{} - Has the output: {}", self.log, path);
                state.up_to_date.insert(
                    path.as_str().to_owned(),
                    UpToDate {
                        producer: Some(producer.clone()),
                        mtime_ns: found_stat.mtime_ns,
                    },
                );
                self.built_outputs.push(path);
            }
        }

        drop(state);
        if let Some(pattern) = missing {
            return self.abort(Error::MissingOutputs { pattern });
        }
        Ok(())
    }

    /// On success, write (or keep) the persistent record.
    fn finish_record(&mut self) -> Result<()> {
        let oracle = match &self.oracle {
            Some(oracle) => oracle,
            None => return Ok(()),
        };
        if !oracle.record_enabled() {
            return Ok(());
        }
        if self.did_skip {
            if let Some(warning) = oracle.completion_warning(&self.record, self.action_index) {
                warn!("{} - {}", self.log, warning);
            }
            return Ok(());
        }
        self.record.outputs = self
            .built_outputs
            .iter()
            .map(|path| path.as_str().to_owned())
            .collect();
        persist::store(&self.engine.opts.persistent_directory, &self.record)
    }

    /// Mark every output of a failed step as poisoned, removing the
    /// non-`precious` ones when the policy says so.
    fn poison_outputs(&mut self, scrub: bool) {
        if self.step.is_none() {
            return;
        }
        let engine = self.engine.clone();
        let mut state = match engine.lock() {
            Ok(state) => state,
            Err(_) => return,
        };
        for output in &self.formatted {
            match &output.pattern {
                None => {
                    state.poisoned.insert(output.path.as_str().to_owned());
                }
                Some(pattern) => {
                    let found = match pattern.glob(&mut state.stat) {
                        Ok(found) => found,
                        Err(_) => continue,
                    };
                    for (path, _) in found {
                        state.poisoned.insert(path.as_str().to_owned());
                        if scrub
                            && engine.opts.remove_failed_outputs
                            && !path.is_precious()
                        {
                            debug!(target: FILE, "{} - Remove the failed output: {}", self.log, path);
                            self.remove_output(&mut state, path.as_str());
                        }
                    }
                }
            }
        }
    }
}

/// The handle a step body uses to talk to the engine: requirements, syncs,
/// actions, parameters, and glob helpers, all resolved against this step
/// instance.
pub struct StepContext<'a> {
    invocation: &'a mut Invocation,
}

impl StepContext<'_> {
    /// The parameters captured from the required path.
    pub fn bindings(&self) -> &Bindings {
        &self.invocation.bindings
    }

    /// One captured parameter by name.
    pub fn binding(&self, name: &str) -> Result<&str> {
        self.invocation
            .bindings
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| Error::Config {
                message: format!(
                    "The step: {} has no captured parameter: {name}",
                    self.invocation.identity
                ),
            })
    }

    /// Require an input to be up-to-date before the next action or the end
    /// of the step. Queues the producing step and returns immediately.
    pub fn require(&mut self, path: impl Into<APath>) -> Result<()> {
        self.invocation.require(path.into())
    }

    /// Wait until all the inputs required so far are built.
    pub fn sync(&mut self) -> Result<()> {
        self.invocation.sync()
    }

    /// Execute a shell command (via `/bin/sh -c`); the caller is
    /// responsible for quoting. Implies a `sync`. A leading `@` makes the
    /// action silent.
    pub fn shell<I, P>(&mut self, command: I) -> Result<()>
    where
        I: IntoIterator<Item = P>,
        P: Into<APath>,
    {
        let argv: Vec<APath> = command.into_iter().map(Into::into).collect();
        self.invocation.run_action(Kind::Shell, argv, &[])
    }

    /// Like [`StepContext::shell`], with explicit resource draws.
    pub fn shell_with<I, P>(&mut self, command: I, resources: &[(&str, i64)]) -> Result<()>
    where
        I: IntoIterator<Item = P>,
        P: Into<APath>,
    {
        let argv: Vec<APath> = command.into_iter().map(Into::into).collect();
        let resources: Vec<(String, i64)> = resources
            .iter()
            .map(|(name, amount)| (name.to_string(), *amount))
            .collect();
        self.invocation.run_action(Kind::Shell, argv, &resources)
    }

    /// Execute a program directly with an argument vector. Implies a
    /// `sync`. A leading `@` makes the action silent.
    pub fn spawn<I, P>(&mut self, command: I) -> Result<()>
    where
        I: IntoIterator<Item = P>,
        P: Into<APath>,
    {
        let argv: Vec<APath> = command.into_iter().map(Into::into).collect();
        self.invocation.run_action(Kind::Spawn, argv, &[])
    }

    /// Like [`StepContext::spawn`], with explicit resource draws.
    pub fn spawn_with<I, P>(&mut self, command: I, resources: &[(&str, i64)]) -> Result<()>
    where
        I: IntoIterator<Item = P>,
        P: Into<APath>,
    {
        let argv: Vec<APath> = command.into_iter().map(Into::into).collect();
        let resources: Vec<(String, i64)> = resources
            .iter()
            .map(|(name, amount)| (name.to_string(), *amount))
            .collect();
        self.invocation.run_action(Kind::Spawn, argv, &resources)
    }

    /// Read a parameter. The resolved value becomes part of this step's
    /// persistent record, so changing it triggers a rebuild.
    pub fn parameter(&mut self, name: &str) -> Result<Value> {
        let value = self
            .invocation
            .engine
            .params
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownParameter {
                name: name.to_owned(),
                file: None,
            })?;
        self.invocation
            .record
            .config
            .entry(name.to_owned())
            .or_insert_with(|| value.clone());
        Ok(value)
    }

    /// Read a string parameter.
    pub fn parameter_str(&mut self, name: &str) -> Result<String> {
        let value = self.parameter(name)?;
        value.as_str().map(str::to_owned).ok_or_else(|| Error::Config {
            message: format!("The parameter: {name} does not hold a string value"),
        })
    }

    /// Expand `{name}` holes in a template from this step's bindings.
    pub fn fmt(&self, template: impl Into<APath>) -> Result<APath> {
        patterns::fmt(&self.invocation.bindings, template)
    }

    /// Expand a pattern against this step's bindings and compile it.
    fn compile(&self, pattern: impl Into<APath>) -> Result<Pattern> {
        let resolved = patterns::fmt_capture(&self.invocation.bindings, pattern.into())?;
        Pattern::new(resolved)
    }

    /// Glob a pattern (first expanded against this step's bindings) and
    /// capture the bindings of each match. A non-`optional` pattern with no
    /// matches is an error.
    pub fn glob_capture(&mut self, pattern: impl Into<APath>) -> Result<Captured> {
        let compiled = self.compile(pattern)?;
        let engine = self.invocation.engine.clone();
        let mut state = engine.lock()?;
        let captured = compiled.glob_capture(&mut state.stat)?;
        drop(state);
        if captured.paths.is_empty() && !compiled.source().is_optional() {
            return Err(Error::NoMatches {
                pattern: compiled.source().as_str().to_owned(),
            });
        }
        Ok(captured)
    }

    /// Glob a pattern and return just the matching paths.
    pub fn glob_paths(&mut self, pattern: impl Into<APath>) -> Result<Vec<APath>> {
        Ok(self.glob_capture(pattern)?.paths)
    }

    /// Glob a pattern and return just the captured bindings.
    pub fn glob_extract(&mut self, pattern: impl Into<APath>) -> Result<Vec<Bindings>> {
        Ok(self.glob_capture(pattern)?.bindings)
    }

    /// Glob a pattern and format a template once per match.
    pub fn glob_fmt(
        &mut self,
        pattern: impl Into<APath>,
        template: impl Into<APath>,
    ) -> Result<Vec<APath>> {
        let template = template.into();
        let captured = self.glob_capture(pattern)?;
        let mut results = Vec::new();
        for bindings in &captured.bindings {
            results.push(patterns::format_pattern(&template, bindings)?);
        }
        Ok(results)
    }

    /// The index-th path required so far.
    pub fn input(&self, index: usize) -> Result<APath> {
        self.invocation
            .required
            .get(index)
            .cloned()
            .ok_or_else(|| Error::Config {
                message: format!(
                    "The step: {} has no required input at index: {index}",
                    self.invocation.identity
                ),
            })
    }

    /// The index-th resolved output pattern of this step instance.
    pub fn output(&self, index: usize) -> Result<APath> {
        self.invocation
            .formatted
            .get(index)
            .map(|output| output.path.clone())
            .ok_or_else(|| Error::Config {
                message: format!(
                    "The step: {} has no output at index: {index}",
                    self.invocation.identity
                ),
            })
    }
}

/// The build engine builder: register steps, parameters and resources, then
/// [`Make::build`] targets.
///
/// # Examples
///
/// ```no_run
/// use dynamake::{Make, Result};
///
/// fn main() -> Result<()> {
///     let mut make = Make::new();
///     make.step("compile", ["obj/{*name}.o"], |context| {
///         let source = format!("src/{}.c", context.binding("name")?);
///         context.require(source.as_str())?;
///         context.shell(["cc", "-c", source.as_str(), "-o", "obj/a.o"])
///     })?;
///     make.build(&["obj/a.o"])?;
///     Ok(())
/// }
/// ```
pub struct Make {
    registry: Arc<Registry>,
    params: Params,
    resources: Vec<(String, i64)>,
}

impl Make {
    pub fn new() -> Make {
        Make {
            registry: Arc::new(Registry::new()),
            params: Params::new(),
            resources: Vec::new(),
        }
    }

    fn registry_mut(&mut self) -> Result<&mut Registry> {
        Arc::get_mut(&mut self.registry).ok_or_else(|| Error::Config {
            message: "Late registration of a step".to_owned(),
        })
    }

    /// Register a build step with the output patterns it produces.
    pub fn step<I, P, F>(&mut self, name: &str, outputs: I, body: F) -> Result<()>
    where
        I: IntoIterator<Item = P>,
        P: Into<APath>,
        F: Fn(&mut StepContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.step_with(name, outputs, StepConfig::default(), body)
    }

    /// Register a build step with an explicit priority and per-step
    /// resource defaults.
    pub fn step_with<I, P, F>(
        &mut self,
        name: &str,
        outputs: I,
        config: StepConfig,
        body: F,
    ) -> Result<()>
    where
        I: IntoIterator<Item = P>,
        P: Into<APath>,
        F: Fn(&mut StepContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        let outputs: Vec<APath> = outputs.into_iter().map(Into::into).collect();
        self.registry_mut()?
            .register(name, outputs, config, Box::new(body))
    }

    /// Register a user parameter.
    pub fn parameter(
        &mut self,
        name: &str,
        kind: ParamKind,
        default: Value,
        description: &str,
    ) -> Result<()> {
        self.params.define(name, None, kind, default, description)
    }

    /// The parameter store, for reading resolved values.
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// The parameter store, for loading configuration files and applying
    /// overrides before a build.
    pub fn params_mut(&mut self) -> &mut Params {
        &mut self.params
    }

    /// Declare parameters as consumable resources: each parameter's
    /// resolved value is the total budget, and the given amount is the
    /// per-action draw when an action does not request one explicitly.
    pub fn resource_parameters(&mut self, defaults: &[(&str, i64)]) -> Result<()> {
        for (name, amount) in defaults {
            if self.params.get(name).is_none() {
                return Err(Error::UnknownParameter {
                    name: name.to_string(),
                    file: None,
                });
            }
            self.resources.push((name.to_string(), *amount));
        }
        Ok(())
    }

    /// Render all registered steps with their annotated outputs, sorted by
    /// priority and name.
    pub fn list_steps(&self) -> String {
        let mut steps: Vec<&StepDef> = self.registry.steps().iter().collect();
        steps.sort_by_key(|step| (step.priority(), step.name().to_owned()));

        let mut result = String::new();
        for step in steps {
            if !result.is_empty() {
                result.push('\n');
            }
            result.push_str(&format!("{}:\n", step.name()));
            result.push_str(&format!("  priority: {}\n", step.priority()));
            result.push_str("  outputs:\n");
            let mut outputs: Vec<&Pattern> = step.outputs().iter().collect();
            outputs.sort_by_key(|pattern| pattern.source().as_str().to_owned());
            for pattern in outputs {
                let source = pattern.source();
                let mut properties: Vec<&str> = Vec::new();
                if source.is_exists() {
                    properties.push("exists");
                }
                if source.is_optional() {
                    properties.push("optional");
                }
                if source.is_phony() {
                    properties.push("phony");
                }
                if source.is_precious() {
                    properties.push("precious");
                }
                if properties.is_empty() {
                    result.push_str(&format!("  - {source}\n"));
                } else {
                    result.push_str(&format!("  - {source}: {}\n", properties.join(", ")));
                }
            }
        }
        result
    }

    /// Build the given targets. Returns the build counters on success; the
    /// first failure otherwise (after the build drains).
    pub fn build<T: AsRef<str>>(&self, targets: &[T]) -> Result<BuildReport> {
        let opts = Options::from_params(&self.params)?;

        let mut res_total: BTreeMap<String, i64> = BTreeMap::new();
        let mut res_default: BTreeMap<String, i64> = BTreeMap::new();
        res_total.insert("jobs".to_owned(), opts.jobs);
        res_default.insert("jobs".to_owned(), 1);
        for (name, amount) in &self.resources {
            let total = self.params.get_i64(name)?;
            if *amount > total {
                return Err(Error::Config {
                    message: format!(
                        "The default amount: {amount} of the resource: {name} \
                         is greater than the total amount: {total}"
                    ),
                });
            }
            res_total.insert(name.clone(), total);
            res_default.insert(name.clone(), *amount);
        }
        let res_available = res_total.clone();

        let engine = Arc::new(Engine {
            registry: self.registry.clone(),
            params: self.params.clone(),
            opts,
            state: Mutex::new(EngineState {
                stat: StatCache::new(),
                up_to_date: HashMap::new(),
                phony: HashSet::new(),
                poisoned: HashSet::new(),
                instances: HashMap::new(),
                res_total,
                res_available,
                res_default,
                actions_count: 0,
                skipped_count: 0,
                aborting: false,
                hard_failed: false,
                dry_stopped: false,
                first_failure: None,
                config_error: None,
                threads: Vec::new(),
            }),
            completed: Condvar::new(),
            resources: Condvar::new(),
        });

        if log_enabled!(target: TRACE, Level::Debug) {
            let targets: Vec<&str> = targets.iter().map(AsRef::as_ref).collect();
            debug!(target: TRACE, "make - Targets: {}", targets.join(" "));
        }

        let mut top = Invocation::top(engine.clone());
        let mut result = Ok(());
        for target in targets {
            result = top.require(APath::from(target.as_ref()));
            if result.is_err() {
                break;
            }
        }
        if result.is_ok() {
            result = top.sync();
        }

        // Drain: every spawned instance must terminate before we report,
        // including in failure modes (running actions finish, nothing new
        // starts).
        loop {
            let handles = {
                let mut state = engine.lock()?;
                std::mem::take(&mut state.threads)
            };
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                let _ = handle.join();
            }
        }

        let state = engine.lock()?;
        let report = BuildReport {
            actions: state.actions_count,
            skipped: state.skipped_count,
            dry_stopped: state.dry_stopped,
        };

        if let Some(message) = &state.config_error {
            error!("make - Fail");
            return Err(Error::Config {
                message: message.clone(),
            });
        }
        if state.hard_failed {
            error!("make - Fail");
            let step = state
                .first_failure
                .clone()
                .unwrap_or_else(|| "make".to_owned());
            return Err(Error::StepFailed { step });
        }
        drop(state);
        if let Err(error) = result {
            if !matches!(error, Error::DryRun) {
                error!("make - Fail");
                return Err(error);
            }
        }

        if report.actions > 0 {
            debug!(target: TRACE, "make - Done");
        } else if report.skipped > 0 {
            debug!(target: TRACE, "make - Skipped");
        } else {
            debug!(target: TRACE, "make - Complete");
        }
        Ok(report)
    }
}

impl Default for Make {
    fn default() -> Self {
        Make::new()
    }
}
