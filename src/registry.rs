//! # Rule Registry
//!
//! Steps are registered with the output patterns they can produce. When a
//! path is required, the registry answers: which step instance produces it?
//!
//! Resolution considers every step with a matching output pattern, restricts
//! to the highest priority tier, and demands that exactly one step remain —
//! two steps claiming the same path at the same priority is a fatal
//! configuration error. When no step matches at all, the path must already
//! exist on disk as a source file; otherwise there is no rule to make it.
//!
//! When several output patterns *of the same step* match a path, the one
//! with the most literal characters before its first capture wins, falling
//! back to declaration order. All output patterns of one step must capture
//! exactly the same set of names, so the winning pattern fully determines
//! the step instance's bindings.

use std::collections::{BTreeMap, BTreeSet};

use crate::annotations::{clean_path, APath};
use crate::error::{Error, Result};
use crate::exec::StepContext;
use crate::patterns::{Bindings, Pattern};

/// The signature of a step body. The context routes `require`, `sync` and
/// the action helpers into the right step instance.
pub type StepBody = dyn Fn(&mut StepContext<'_>) -> Result<()> + Send + Sync;

/// Optional knobs for registering a step.
#[derive(Debug, Clone, Default)]
pub struct StepConfig {
    /// Higher priority steps override lower ones claiming the same path.
    pub priority: i32,
    /// Default resource draws for this step's actions, used when an action
    /// does not request an explicit amount.
    pub resources: Vec<(String, i64)>,
}

/// A registered build step.
pub struct StepDef {
    pub(crate) name: String,
    pub(crate) outputs: Vec<Pattern>,
    pub(crate) priority: i32,
    pub(crate) resources: BTreeMap<String, i64>,
    pub(crate) body: Box<StepBody>,
}

impl StepDef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn outputs(&self) -> &[Pattern] {
        &self.outputs
    }
}

/// The index of registered steps, keyed by their output patterns.
#[derive(Default)]
pub struct Registry {
    steps: Vec<StepDef>,
    by_name: BTreeMap<String, usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step. The step name must be unique, at least one output
    /// pattern is required, and all output patterns must capture the same
    /// set of names.
    pub fn register(
        &mut self,
        name: &str,
        outputs: Vec<APath>,
        config: StepConfig,
        body: Box<StepBody>,
    ) -> Result<()> {
        if name.is_empty() {
            return Err(Error::Config {
                message: "A step must have a non-empty name".to_owned(),
            });
        }
        if self.by_name.contains_key(name) {
            return Err(Error::Config {
                message: format!("Conflicting definitions for the step: {name}"),
            });
        }
        if outputs.is_empty() {
            return Err(Error::Config {
                message: format!("The step: {name} specifies no output"),
            });
        }

        let mut patterns: Vec<Pattern> = Vec::new();
        let mut captures: Option<BTreeSet<String>> = None;
        for output in outputs {
            let pattern = Pattern::new(clean_path(output)?)?;
            let names: BTreeSet<String> = pattern.captures().iter().cloned().collect();
            match &captures {
                None => captures = Some(names),
                Some(first) if *first != names => {
                    return Err(Error::Config {
                        message: format!(
                            "The step: {name} output patterns must all capture the same names"
                        ),
                    });
                }
                Some(_) => {}
            }
            patterns.push(pattern);
        }

        let index = self.steps.len();
        self.steps.push(StepDef {
            name: name.to_owned(),
            outputs: patterns,
            priority: config.priority,
            resources: config.resources.into_iter().collect(),
            body,
        });
        self.by_name.insert(name.to_owned(), index);
        Ok(())
    }

    /// Find the unique step, if any, that produces a path, together with
    /// the bindings deduced from the path.
    pub fn producer_of(&self, path: &str) -> Result<Option<(usize, Bindings)>> {
        struct Candidate<'a> {
            step: usize,
            name: &'a str,
            priority: i32,
            bindings: Bindings,
        }

        let mut candidates: Vec<Candidate<'_>> = Vec::new();
        for (index, step) in self.steps.iter().enumerate() {
            let mut best: Option<(usize, usize, Bindings)> = None;
            for (declaration, pattern) in step.outputs.iter().enumerate() {
                if let Some(bindings) = pattern.match_path(path) {
                    let prefix = pattern.literal_prefix().len();
                    let better = match &best {
                        None => true,
                        Some((best_prefix, _, _)) => prefix > *best_prefix,
                    };
                    if better {
                        best = Some((prefix, declaration, bindings));
                    }
                }
            }
            if let Some((_, _, bindings)) = best {
                candidates.push(Candidate {
                    step: index,
                    name: &step.name,
                    priority: step.priority,
                    bindings,
                });
            }
        }

        if candidates.is_empty() {
            return Ok(None);
        }

        let top = candidates
            .iter()
            .map(|candidate| candidate.priority)
            .max()
            .unwrap_or(0);
        let mut tier: Vec<Candidate<'_>> = candidates
            .into_iter()
            .filter(|candidate| candidate.priority == top)
            .collect();
        if tier.len() > 1 {
            tier.sort_by_key(|candidate| candidate.name);
            return Err(Error::AmbiguousRule {
                path: path.to_owned(),
                first: tier[0].name.to_owned(),
                second: tier[1].name.to_owned(),
                priority: top,
            });
        }

        let winner = tier.remove(0);
        Ok(Some((winner.step, winner.bindings)))
    }

    pub fn get(&self, index: usize) -> &StepDef {
        &self.steps[index]
    }

    pub fn steps(&self) -> &[StepDef] {
        &self.steps
    }
}
