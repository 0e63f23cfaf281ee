//! Error handling types for the dynamake engine

use thiserror::Error;

/// Main error type for dynamake operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid pattern: {pattern} - {message}")]
    Pattern { pattern: String, message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Unknown parameter: {name}{}", config_file_of(.file))]
    UnknownParameter {
        name: String,
        file: Option<String>,
    },

    #[error("Invalid value: {value} for the parameter: {name}{}", config_file_of(.file))]
    InvalidParameterValue {
        name: String,
        value: String,
        file: Option<String>,
    },

    #[error("Don't know how to make the required: {path}")]
    NoRule { path: String },

    #[error("The required: {path} has failed to build")]
    RequiredFailed { path: String },

    #[error("No files matched the non-optional glob pattern: {pattern}")]
    NoMatches { pattern: String },

    #[error(
        "The output: {path} may be created by both the step: {first} \
         and the step: {second} at the same priority: {priority}"
    )]
    AmbiguousRule {
        path: String,
        first: String,
        second: String,
        priority: i32,
    },

    #[error("Step invokes itself: {chain}")]
    CyclicRequire { chain: String },

    #[error("Failure: {command}")]
    ActionFailed { command: String },

    #[error("Missing the output(s): {pattern}")]
    MissingOutputs { pattern: String },

    #[error("The step: {step} has failed to build its output(s)")]
    StepFailed { step: String },

    #[error("The step: {step} failed to build the required target(s)")]
    SyncFailed { step: String },

    /// Internal control flow: a step skipped earlier actions but a later
    /// action must run, so the whole step body is executed again. Step
    /// bodies observe this only as a value to propagate with `?`.
    #[error("Restarting the step to run previously skipped action(s)")]
    Restart,

    /// Internal control flow: `no_actions` is set and the first pending
    /// action was reached.
    #[error("Stopped before the first pending action")]
    DryRun,

    #[error("Lock poisoned: {context}")]
    Lock { context: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

fn config_file_of(file: &Option<String>) -> String {
    match file {
        Some(path) => format!(" specified in the configuration file: {path}"),
        None => String::new(),
    }
}

impl Error {
    /// Whether this error is a configuration error that must abort the build
    /// immediately, before any persistent state is updated.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::Pattern { .. }
                | Error::Config { .. }
                | Error::UnknownParameter { .. }
                | Error::InvalidParameterValue { .. }
                | Error::AmbiguousRule { .. }
        )
    }
}

/// Result type alias for dynamake operations
pub type Result<T> = std::result::Result<T, Error>;
