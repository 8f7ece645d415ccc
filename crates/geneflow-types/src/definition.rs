//! Workflow and app definition types.
//!
//! A workflow is a DAG of named steps. Each step runs an app once per
//! map-matched item (or once, for reduce steps), with per-item argument
//! values produced from its `template`. Apps carry the exec methods that
//! decide how a step's command is actually run.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::command::{CommandBlock, ExecMethod};

/// Execution context every step runs in unless overridden.
pub const DEFAULT_CONTEXT: &str = "local";

/// Execution context that submits steps to a Grid Engine cluster.
pub const GRIDENGINE_CONTEXT: &str = "gridengine";

/// Exec-method name that defers to conditional selection.
pub const AUTO_METHOD: &str = "auto";

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// A static, validated workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Assigned on load when the file does not carry one.
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub inputs: BTreeMap<String, InputDefinition>,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterDefinition>,
    /// Steps whose output is copied to the job's output location.
    #[serde(default)]
    pub final_output: Vec<String>,
    /// Apps referenced by steps, keyed by the name steps use.
    #[serde(default)]
    pub apps: BTreeMap<String, AppRef>,
    pub steps: BTreeMap<String, StepDefinition>,
}

impl WorkflowDefinition {
    /// Return the inline app definition a step refers to, if resolved.
    pub fn app_for(&self, step: &StepDefinition) -> Option<&AppDefinition> {
        match self.apps.get(&step.app)? {
            AppRef::Inline(app) => Some(app),
            AppRef::Path(_) => None,
        }
    }
}

/// Data type of a workflow or app input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputType {
    File,
    Directory,
    #[default]
    Any,
}

/// Data type of a workflow or app parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterType {
    File,
    Directory,
    #[serde(rename = "string")]
    String,
    #[serde(rename = "int")]
    Int,
    #[serde(rename = "float")]
    Float,
    #[serde(rename = "double")]
    Double,
    #[serde(rename = "long")]
    Long,
    #[default]
    Any,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputDefinition {
    #[serde(rename = "type", default)]
    pub input_type: InputType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Location used when the job does not supply a value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default = "default_true")]
    pub visible: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParameterDefinition {
    #[serde(rename = "type", default)]
    pub parameter_type: ParameterType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default = "default_true")]
    pub visible: bool,
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// A single node in the workflow DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Key into the workflow's `apps` table.
    pub app: String,
    /// Step names this step depends on.
    #[serde(default)]
    pub depend: Vec<String>,
    /// Fan-out specification; `None` makes this a reduce step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map: Option<MapDefinition>,
    /// Raw argument templates keyed by app input/parameter name. Must
    /// contain `output`.
    #[serde(default)]
    pub template: BTreeMap<String, Value>,
    #[serde(default)]
    pub execution: StepExecution,
}

/// Source location and item filter for map expansion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapDefinition {
    #[serde(alias = "source")]
    pub uri: String,
    #[serde(default = "default_map_regex")]
    pub regex: String,
}

fn default_map_regex() -> String {
    ".*".to_string()
}

/// Per-step execution hints from the workflow file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepExecution {
    #[serde(default = "default_context")]
    pub context: String,
    #[serde(default = "default_method")]
    pub method: String,
}

impl Default for StepExecution {
    fn default() -> Self {
        Self {
            context: default_context(),
            method: default_method(),
        }
    }
}

fn default_context() -> String {
    DEFAULT_CONTEXT.to_string()
}

fn default_method() -> String {
    AUTO_METHOD.to_string()
}

// ---------------------------------------------------------------------------
// Apps
// ---------------------------------------------------------------------------

/// An app referenced from a workflow: either already loaded or a path to
/// an app YAML file, relative to the workflow file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AppRef {
    Path(String),
    Inline(Box<AppDefinition>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub inputs: BTreeMap<String, AppInput>,
    #[serde(default)]
    pub parameters: BTreeMap<String, AppParameter>,
    #[serde(default)]
    pub pre_exec: Vec<CommandBlock>,
    #[serde(default)]
    pub exec_methods: Vec<ExecMethod>,
    #[serde(default)]
    pub post_exec: Vec<CommandBlock>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppInput {
    #[serde(rename = "type", default)]
    pub input_type: InputType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    /// Value used by the command when neither the step nor `default` sets one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_default: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_value: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_exec: Vec<CommandBlock>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppParameter {
    #[serde(rename = "type", default)]
    pub parameter_type: ParameterType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_exec: Vec<CommandBlock>,
}

/// Render a template or parameter value as the string substituted into
/// commands. Strings are used verbatim, `null` becomes empty.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
