//! Job driver: walks one job's step graph to a terminal status.
//!
//! The driver owns the job's in-memory view of step statuses. A step is
//! dispatched once every dependency is COMPLETED; a failed step leaves its
//! dependents PENDING while independent branches keep running. The job is
//! COMPLETED only when every step is.

use std::collections::BTreeMap;
use std::sync::Arc;

use geneflow_types::definition::{DEFAULT_CONTEXT, WorkflowDefinition};
use geneflow_types::job::{JobStatus, StepStatus};
use geneflow_types::slug::slugify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::command::{EnvironmentProbe, ProcessHost};
use crate::dag::JobPlan;
use crate::locator::Locator;
use crate::repository::job::StepUpdate;
use crate::template::WorkflowValues;

use super::Runtime;
use super::step::{StepError, StepTask, run_step};

/// One accepted job, ready to drive.
pub(crate) struct JobRun {
    pub id: Uuid,
    pub workflow: Arc<WorkflowDefinition>,
    pub plan: JobPlan,
    pub work: Locator,
    pub output: Locator,
    pub cancel: CancellationToken,
}

/// Drive a job to COMPLETED, FAILED, or CANCELLED and return that status.
pub(crate) async fn drive<H, P>(rt: Arc<Runtime<H, P>>, run: JobRun) -> JobStatus
where
    H: ProcessHost + 'static,
    P: EnvironmentProbe + 'static,
{
    match rt
        .status
        .transition_job(run.id, &[JobStatus::Pending], JobStatus::Running, None)
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            tracing::info!(job_id = %run.id, "job left PENDING before it started");
            return JobStatus::Cancelled;
        }
        Err(e) => {
            tracing::error!(job_id = %run.id, error = %e, "failed to start job");
            return JobStatus::Failed;
        }
    }
    tracing::info!(job_id = %run.id, work = %run.work, "job running");

    let values = match prepare_locations(&rt, &run).await {
        Ok(values) => Arc::new(values),
        Err(e) => return finish(&rt, run.id, JobStatus::Failed, Some(e.to_string())).await,
    };

    let outcome = run_steps(&rt, &run, values).await;

    if run.cancel.is_cancelled() && !outcome.incomplete.is_empty() {
        return finish(&rt, run.id, JobStatus::Cancelled, Some("cancelled".to_string())).await;
    }
    if !outcome.failed.is_empty() {
        let error = format!("failed steps: {}", outcome.failed.join(", "));
        return finish(&rt, run.id, JobStatus::Failed, Some(error)).await;
    }
    if !outcome.incomplete.is_empty() {
        let error = format!("steps did not complete: {}", outcome.incomplete.join(", "));
        return finish(&rt, run.id, JobStatus::Failed, Some(error)).await;
    }

    for name in &run.plan.final_output {
        let Some(source) = outcome.outputs.get(name) else {
            continue;
        };
        let copied = match run.output.join(&slugify(name)) {
            Ok(target) => rt.data.copy(source, &target.as_directory()).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = copied {
            let error = format!("copying final output of '{name}': {e}");
            return finish(&rt, run.id, JobStatus::Failed, Some(error)).await;
        }
        tracing::debug!(job_id = %run.id, step = %name, "copied final output");
    }

    finish(&rt, run.id, JobStatus::Completed, None).await
}

async fn finish<H, P>(rt: &Runtime<H, P>, id: Uuid, status: JobStatus, error: Option<String>) -> JobStatus {
    match rt
        .status
        .transition_job(id, &[JobStatus::Running], status, error.clone())
        .await
    {
        Ok(true) => {
            match &error {
                Some(error) => tracing::warn!(job_id = %id, %status, error = %error, "job finished"),
                None => tracing::info!(job_id = %id, %status, "job finished"),
            }
            status
        }
        Ok(false) => {
            // Cancelled out-of-band through the store.
            tracing::info!(job_id = %id, "job was no longer RUNNING");
            JobStatus::Cancelled
        }
        Err(e) => {
            tracing::error!(job_id = %id, error = %e, "failed to record job status");
            JobStatus::Failed
        }
    }
}

// ---------------------------------------------------------------------------
// Locations
// ---------------------------------------------------------------------------

/// Create the job's directories and stage inputs that live outside the
/// work location's scheme.
async fn prepare_locations<H, P>(
    rt: &Runtime<H, P>,
    run: &JobRun,
) -> Result<WorkflowValues, StepError> {
    rt.data.mkdir(&run.work).await?;
    rt.data.mkdir(&run.output).await?;

    let mut values = run.plan.values.clone();
    for (name, input) in values.inputs.iter_mut() {
        if input.scheme() == run.work.scheme() {
            continue;
        }
        let mut target = run.work.join(&format!("_input-{}", slugify(name)))?;
        if input.is_directory() {
            target = target.as_directory();
        } else {
            rt.data.mkdir(&target.as_directory()).await?;
        }
        let staged = input.switch_context(&target);
        tracing::info!(input = %name, from = %input, to = %staged, "staging input");
        rt.data.copy(input, &staged).await?;
        *input = staged;
    }
    Ok(values)
}

// ---------------------------------------------------------------------------
// Step dispatch
// ---------------------------------------------------------------------------

struct StepsOutcome {
    outputs: BTreeMap<String, Locator>,
    failed: Vec<String>,
    /// Steps not COMPLETED, in topological order.
    incomplete: Vec<String>,
}

async fn run_steps<H, P>(rt: &Arc<Runtime<H, P>>, run: &JobRun, values: Arc<WorkflowValues>) -> StepsOutcome
where
    H: ProcessHost + 'static,
    P: EnvironmentProbe + 'static,
{
    let mut statuses: BTreeMap<String, StepStatus> = run
        .plan
        .order
        .iter()
        .map(|name| (name.clone(), StepStatus::Pending))
        .collect();
    let mut outputs: BTreeMap<String, Locator> = BTreeMap::new();
    let mut failed = Vec::new();
    let mut join_set: JoinSet<(String, Result<Locator, StepError>)> = JoinSet::new();

    loop {
        if !run.cancel.is_cancelled() {
            for name in &run.plan.order {
                if statuses[name.as_str()] != StepStatus::Pending {
                    continue;
                }
                let Some(step) = run.workflow.steps.get(name) else {
                    continue;
                };
                let ready = step
                    .depend
                    .iter()
                    .all(|d| statuses.get(d.as_str()) == Some(&StepStatus::Completed));
                if !ready {
                    continue;
                }
                let Some(app) = run.workflow.app_for(step) else {
                    tracing::error!(job_id = %run.id, step = %name, app = %step.app, "step app is not loaded");
                    continue;
                };

                if let Err(e) = rt
                    .status
                    .transition_step(run.id, name, StepStatus::Pending, StepStatus::Running, StepUpdate::default())
                    .await
                {
                    tracing::error!(job_id = %run.id, step = %name, error = %e, "failed to start step");
                    failed.push(name.clone());
                    statuses.insert(name.clone(), StepStatus::Failed);
                    continue;
                }
                statuses.insert(name.clone(), StepStatus::Running);

                let task = StepTask {
                    job_id: run.id,
                    name: name.clone(),
                    step: step.clone(),
                    app: Arc::new(app.clone()),
                    method: run.plan.methods.get(name).cloned().unwrap_or_default(),
                    context: run
                        .plan
                        .contexts
                        .get(name)
                        .cloned()
                        .unwrap_or_else(|| DEFAULT_CONTEXT.to_string()),
                    values: Arc::clone(&values),
                    dependencies: step
                        .depend
                        .iter()
                        .filter_map(|d| outputs.get(d).map(|o| (d.clone(), o.clone())))
                        .collect(),
                    work: run.work.clone(),
                    cancel: run.cancel.clone(),
                };
                let rt = Arc::clone(rt);
                let step_name = name.clone();
                join_set.spawn(async move {
                    let result = tokio::spawn(run_step(rt, task))
                        .await
                        .unwrap_or_else(|e| Err(StepError::Panicked(e.to_string())));
                    (step_name, result)
                });
            }
        }

        let Some(joined) = join_set.join_next().await else {
            break;
        };
        let (name, result) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(job_id = %run.id, error = %e, "step driver task failed");
                continue;
            }
        };

        let (status, update) = match &result {
            Ok(output) => (
                StepStatus::Completed,
                StepUpdate {
                    output_uri: Some(output.serialize()),
                    ..Default::default()
                },
            ),
            Err(e) => (
                StepStatus::Failed,
                StepUpdate {
                    error: Some(e.detail()),
                    ..Default::default()
                },
            ),
        };
        match &result {
            Ok(_) => tracing::info!(job_id = %run.id, step = %name, "step completed"),
            Err(e) => tracing::warn!(job_id = %run.id, step = %name, error = %e, "step failed"),
        }

        if let Err(e) = rt
            .status
            .transition_step(run.id, &name, StepStatus::Running, status, update)
            .await
        {
            tracing::error!(job_id = %run.id, step = %name, error = %e, "failed to record step status");
        }

        statuses.insert(name.clone(), status);
        match result {
            Ok(output) => {
                outputs.insert(name, output);
            }
            Err(_) => failed.push(name),
        }
    }

    let incomplete = run
        .plan
        .order
        .iter()
        .filter(|name| statuses.get(name.as_str()) != Some(&StepStatus::Completed))
        .cloned()
        .collect();
    StepsOutcome {
        outputs,
        failed,
        incomplete,
    }
}
