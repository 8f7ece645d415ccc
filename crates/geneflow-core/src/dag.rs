//! Workflow graph validation and job preparation.
//!
//! Everything here runs before a job is persisted: a workflow (and the job
//! parameters applied to it) either passes every check or the job is never
//! created.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use geneflow_types::definition::{AUTO_METHOD, DEFAULT_CONTEXT, StepDefinition, WorkflowDefinition};
use geneflow_types::error::LocatorError;
use geneflow_types::job::JobDefinition;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde_json::Value;
use thiserror::Error;

use crate::locator::Locator;
use crate::template::{Placeholder, WorkflowValues, compile_map_regex, placeholders};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// A workflow or job that cannot be scheduled. Fatal to the whole job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphValidationError {
    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("cycle detected involving step '{0}'")]
    Cycle(String),

    #[error("step '{step}' uses unresolved app '{app}'")]
    UnresolvedApp { step: String, app: String },

    #[error("step '{0}' template has no 'output' entry")]
    MissingOutput(String),

    #[error("step '{step}': invalid reference '{placeholder}': {reason}")]
    InvalidReference {
        step: String,
        placeholder: String,
        reason: String,
    },

    #[error("step '{step}': invalid map regex: {reason}")]
    InvalidRegex { step: String, reason: String },

    #[error("final_output names unknown step '{0}'")]
    UnknownFinalOutput(String),

    #[error("job sets undeclared input '{0}'")]
    UnknownInput(String),

    #[error("job sets undeclared parameter '{0}'")]
    UnknownParameter(String),

    #[error("input '{0}' has no value")]
    MissingInput(String),

    #[error("parameter '{0}' has no value")]
    MissingParameter(String),

    #[error("input '{name}': {source}")]
    InvalidInput {
        name: String,
        #[source]
        source: LocatorError,
    },

    #[error("step '{step}': unsupported execution context '{context}'")]
    UnsupportedContext { step: String, context: String },

    #[error("step '{step}': exec method '{method}' is not defined by app '{app}'")]
    UnknownMethod {
        step: String,
        method: String,
        app: String,
    },
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// Topological order of the steps, ties broken by step name.
///
/// Fails on unknown dependencies and cycles.
pub fn topological_order(
    steps: &BTreeMap<String, StepDefinition>,
) -> Result<Vec<String>, GraphValidationError> {
    let mut graph = DiGraph::<&str, ()>::new();
    let nodes: HashMap<&str, _> = steps
        .keys()
        .map(|name| (name.as_str(), graph.add_node(name.as_str())))
        .collect();

    for (name, step) in steps {
        for dep in &step.depend {
            let from = nodes
                .get(dep.as_str())
                .ok_or_else(|| GraphValidationError::UnknownDependency {
                    step: name.clone(),
                    dependency: dep.clone(),
                })?;
            graph.add_edge(*from, nodes[name.as_str()], ());
        }
    }

    toposort(&graph, None)
        .map_err(|cycle| GraphValidationError::Cycle(graph[cycle.node_id()].to_string()))?;

    // Kahn's algorithm over a sorted ready set gives a stable numbering.
    let mut remaining: HashMap<&str, usize> = steps
        .iter()
        .map(|(name, step)| (name.as_str(), step.depend.iter().collect::<BTreeSet<_>>().len()))
        .collect();
    let mut ready: BTreeSet<&str> = remaining
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut order = Vec::with_capacity(steps.len());

    while let Some(name) = ready.pop_first() {
        order.push(name.to_string());
        for (other, step) in steps {
            if step.depend.iter().any(|d| d == name) {
                if let Some(count) = remaining.get_mut(other.as_str()) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(other.as_str());
                    }
                }
            }
        }
    }
    Ok(order)
}

// ---------------------------------------------------------------------------
// Workflow validation
// ---------------------------------------------------------------------------

/// Validate a workflow's structure and references. Returns the step order.
pub fn validate_workflow(workflow: &WorkflowDefinition) -> Result<Vec<String>, GraphValidationError> {
    let order = topological_order(&workflow.steps)?;

    for name in &workflow.final_output {
        if !workflow.steps.contains_key(name) {
            return Err(GraphValidationError::UnknownFinalOutput(name.clone()));
        }
    }

    for (name, step) in &workflow.steps {
        if workflow.app_for(step).is_none() {
            return Err(GraphValidationError::UnresolvedApp {
                step: name.clone(),
                app: step.app.clone(),
            });
        }
        if !step.template.contains_key("output") {
            return Err(GraphValidationError::MissingOutput(name.clone()));
        }
        check_references(workflow, name, step)?;
    }

    Ok(order)
}

fn check_references(
    workflow: &WorkflowDefinition,
    name: &str,
    step: &StepDefinition,
) -> Result<(), GraphValidationError> {
    let captures = match &step.map {
        Some(map) => {
            let re = compile_map_regex(&map.regex).map_err(|e| GraphValidationError::InvalidRegex {
                step: name.to_string(),
                reason: e.to_string(),
            })?;
            Some(re.captures_len() - 1)
        }
        None => None,
    };

    let invalid = |raw: &str, reason: String| GraphValidationError::InvalidReference {
        step: name.to_string(),
        placeholder: raw.to_string(),
        reason,
    };

    let check = |template: &str, captures: Option<usize>| -> Result<(), GraphValidationError> {
        for (raw, placeholder) in placeholders(template) {
            match placeholder {
                Placeholder::Workflow(value) => {
                    if !workflow.inputs.contains_key(&value)
                        && !workflow.parameters.contains_key(&value)
                    {
                        return Err(invalid(&raw, "not a workflow input or parameter".into()));
                    }
                }
                Placeholder::Step { step: target, var } => {
                    if !step.depend.contains(&target) {
                        return Err(invalid(&raw, format!("'{target}' is not listed in depend")));
                    }
                    if var != "output" {
                        return Err(invalid(&raw, "only '->output' may be referenced".into()));
                    }
                }
                Placeholder::Capture(index) => match captures {
                    None => return Err(invalid(&raw, "capture groups need a map".into())),
                    Some(count) if index == 0 || index > count => {
                        return Err(invalid(
                            &raw,
                            format!("map regex has {count} capture groups"),
                        ));
                    }
                    Some(_) => {}
                },
            }
        }
        Ok(())
    };

    if let Some(map) = &step.map {
        check(&map.uri, None)?;
    }
    for value in step.template.values() {
        if let Value::String(s) = value {
            check(s, captures)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Job preparation
// ---------------------------------------------------------------------------

/// A workflow with job parameters applied and validated.
#[derive(Debug, Clone)]
pub struct JobPlan {
    /// Steps in topological order.
    pub order: Vec<String>,
    pub values: WorkflowValues,
    pub final_output: Vec<String>,
    /// Exec method requested per step (`auto` or a method name).
    pub methods: BTreeMap<String, String>,
    /// Execution context per step.
    pub contexts: BTreeMap<String, String>,
}

impl JobPlan {
    /// Fail on the first step (in topological order) whose context is not
    /// `local` and not accepted by `available`.
    pub fn check_contexts(
        &self,
        available: impl Fn(&str) -> bool,
    ) -> Result<(), GraphValidationError> {
        for step in &self.order {
            let Some(context) = self.contexts.get(step) else {
                continue;
            };
            if context != DEFAULT_CONTEXT && !available(context) {
                return Err(GraphValidationError::UnsupportedContext {
                    step: step.clone(),
                    context: context.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Validate `workflow` and apply `job` to it.
pub fn prepare_job(
    workflow: &WorkflowDefinition,
    job: &JobDefinition,
) -> Result<JobPlan, GraphValidationError> {
    let order = validate_workflow(workflow)?;

    if let Some(name) = job.inputs.keys().find(|k| !workflow.inputs.contains_key(*k)) {
        return Err(GraphValidationError::UnknownInput(name.clone()));
    }
    if let Some(name) = job.parameters.keys().find(|k| !workflow.parameters.contains_key(*k)) {
        return Err(GraphValidationError::UnknownParameter(name.clone()));
    }

    let mut values = WorkflowValues::default();
    for (name, input) in &workflow.inputs {
        let raw = job.inputs.get(name).or(input.default.as_ref());
        match raw {
            Some(raw) if !raw.is_empty() => {
                let locator =
                    Locator::parse(raw).map_err(|source| GraphValidationError::InvalidInput {
                        name: name.clone(),
                        source,
                    })?;
                values.inputs.insert(name.clone(), locator);
            }
            _ if input.enable => return Err(GraphValidationError::MissingInput(name.clone())),
            _ => {}
        }
    }
    for (name, param) in &workflow.parameters {
        match job.parameters.get(name).or(param.default.as_ref()) {
            Some(value) => {
                values.parameters.insert(name.clone(), value.clone());
            }
            None if param.enable => {
                return Err(GraphValidationError::MissingParameter(name.clone()));
            }
            None => {}
        }
    }

    let final_output = job
        .final_output
        .clone()
        .unwrap_or_else(|| workflow.final_output.clone());
    if let Some(name) = final_output.iter().find(|n| !workflow.steps.contains_key(*n)) {
        return Err(GraphValidationError::UnknownFinalOutput(name.clone()));
    }

    let mut methods = BTreeMap::new();
    let mut contexts = BTreeMap::new();
    for (name, step) in &workflow.steps {
        let context = job.execution.context_for(name, &step.execution.context);
        contexts.insert(name.clone(), context.to_string());

        let method = job.execution.method_for(name, &step.execution.method);
        if method != AUTO_METHOD {
            let defined = workflow
                .app_for(step)
                .is_some_and(|app| app.exec_methods.iter().any(|m| m.name == method));
            if !defined {
                return Err(GraphValidationError::UnknownMethod {
                    step: name.clone(),
                    method: method.to_string(),
                    app: step.app.clone(),
                });
            }
        }
        methods.insert(name.clone(), method.to_string());
    }

    Ok(JobPlan {
        order,
        values,
        final_output,
        methods,
        contexts,
    })
}
