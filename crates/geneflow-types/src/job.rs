//! Job parameters and the persisted job/step status records.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::definition::{AUTO_METHOD, DEFAULT_CONTEXT};

// ---------------------------------------------------------------------------
// Job parameters
// ---------------------------------------------------------------------------

/// Caller-supplied parameters for one run of a workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobDefinition {
    #[serde(default)]
    pub name: Option<String>,
    /// Base location for intermediate step data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_uri: Option<String>,
    /// Base location for `final_output` copies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_uri: Option<String>,
    /// Omit the job-id suffix from the job's work/output directory names.
    #[serde(default)]
    pub no_output_hash: bool,
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    /// Overrides the workflow's `final_output` list when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_output: Option<Vec<String>>,
    #[serde(default)]
    pub execution: JobExecution,
}

/// Per-step execution overrides. Each map may carry a `default` key that
/// applies to steps not listed by name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobExecution {
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    #[serde(default)]
    pub method: BTreeMap<String, String>,
}

impl JobExecution {
    /// Resolve the execution context for a step: step entry, then `default`,
    /// then the workflow's own setting.
    pub fn context_for<'a>(&'a self, step: &str, workflow_value: &'a str) -> &'a str {
        Self::lookup(&self.context, step, workflow_value, DEFAULT_CONTEXT)
    }

    /// Resolve the exec method for a step, same precedence as `context_for`.
    pub fn method_for<'a>(&'a self, step: &str, workflow_value: &'a str) -> &'a str {
        Self::lookup(&self.method, step, workflow_value, AUTO_METHOD)
    }

    fn lookup<'a>(
        table: &'a BTreeMap<String, String>,
        step: &str,
        workflow_value: &'a str,
        builtin: &str,
    ) -> &'a str {
        if let Some(v) = table.get(step) {
            return v;
        }
        // A workflow-level value other than the builtin wins over the job default.
        if workflow_value != builtin {
            return workflow_value;
        }
        table.get("default").map(String::as_str).unwrap_or(workflow_value)
    }
}

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().to_uppercase())
    }
}

/// Status of one step (or one map item of a step) within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// `PENDING -> RUNNING -> {COMPLETED | FAILED}`; nothing else.
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().to_uppercase())
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A persisted job row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub name: String,
    pub workflow_id: Uuid,
    pub workflow_name: String,
    pub workflow_version: String,
    pub status: JobStatus,
    /// Input name -> location string, after defaults were applied.
    pub inputs: BTreeMap<String, String>,
    pub parameters: BTreeMap<String, Value>,
    /// Job-scoped work location (`<work_uri>/<job dir>`).
    pub work_uri: String,
    /// Job-scoped output location (`<output_uri>/<job dir>`).
    pub output_uri: String,
    pub error: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A persisted step row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub job_id: Uuid,
    pub name: String,
    /// Position in topological order, starting at 1.
    pub number: u32,
    pub status: StepStatus,
    pub items: Vec<MapItemRecord>,
    /// Base output location, set once the step completes.
    pub output_uri: Option<String>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    pub fn pending(job_id: Uuid, name: &str, number: u32) -> Self {
        Self {
            job_id,
            name: name.to_string(),
            number,
            status: StepStatus::Pending,
            items: Vec::new(),
            output_uri: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Execution record of one map item (one invocation) of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapItemRecord {
    /// Matched entry name, or `root` for reduce steps.
    pub filename: String,
    pub status: StepStatus,
    pub attempt: u32,
    /// Fully resolved template values for this item.
    #[serde(default)]
    pub template: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A job plus its steps, as surfaced by `job_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub job: JobRecord,
    pub steps: Vec<StepRecord>,
}

impl JobReport {
    /// Names of steps that ended FAILED.
    pub fn failed_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .map(|s| s.name.as_str())
            .collect()
    }
}
