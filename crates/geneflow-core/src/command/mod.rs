//! Execution-command model.
//!
//! Selection picks an app's exec method by evaluating its conditions
//! against the per-item variables and an [`EnvironmentProbe`]. The
//! selected method's blocks are built into an [`ExecutablePlan`] and run
//! on a [`ProcessHost`].

pub mod plan;
pub mod predicate;
pub mod process;
pub mod runner;

use geneflow_types::command::ExecMethod;
use geneflow_types::definition::AUTO_METHOD;
use geneflow_types::error::ResolutionError;
use thiserror::Error;

pub use plan::{
    ExecutablePlan, LogTargets, Pipeline, PlanStep, ProcessSpec, Redirect, build, shell_quote,
};
pub use predicate::{EnvironmentProbe, Vars, evaluate, evaluate_all, substitute};
pub use process::{InvocationError, InvocationOutcome, ProcessHandle, ProcessHost};
pub use runner::execute;

/// Errors from choosing or building a command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("no exec method available (tried: {tried})")]
    NoExecMethodAvailable { tried: String },

    #[error("exec method '{0}' is not defined by the app")]
    UnknownMethod(String),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),
}

/// Choose the exec method to run.
///
/// With `requested == "auto"` the first method (in listed order) whose
/// conditions all hold is returned. Any other name forces that method,
/// regardless of its conditions.
pub fn select<'a>(
    methods: &'a [ExecMethod],
    requested: &str,
    vars: &Vars,
    probe: &dyn EnvironmentProbe,
) -> Result<&'a ExecMethod, CommandError> {
    if requested != AUTO_METHOD {
        return methods
            .iter()
            .find(|m| m.name == requested)
            .ok_or_else(|| CommandError::UnknownMethod(requested.to_string()));
    }

    methods
        .iter()
        .find(|m| evaluate_all(&m.condition, vars, probe))
        .ok_or_else(|| CommandError::NoExecMethodAvailable {
            tried: methods
                .iter()
                .map(|m| m.name.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        })
}
