//! `gf run` and `gf validate`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Args;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use geneflow_core::dag::{prepare_job, validate_workflow};
use geneflow_core::definition::{load_job_file, load_workflow_file};
use geneflow_types::job::{JobDefinition, JobReport, JobStatus, StepStatus};

use crate::cli::job::print_report;
use crate::state::AppState;

/// Arguments of `gf run`.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the workflow YAML file.
    pub workflow: PathBuf,

    /// Path to a job YAML file; command-line options override its values.
    #[arg(long)]
    pub job: Option<PathBuf>,

    /// Job name (defaults to the workflow name).
    #[arg(long)]
    pub name: Option<String>,

    /// Workflow input, as NAME=LOCATION.
    #[arg(short = 'i', long = "input", value_parser = parse_key_value)]
    pub inputs: Vec<(String, String)>,

    /// Workflow parameter, as NAME=VALUE. VALUE is read as a YAML scalar.
    #[arg(short = 'p', long = "param", value_parser = parse_key_value)]
    pub parameters: Vec<(String, String)>,

    /// Base location for intermediate data.
    #[arg(long)]
    pub work_uri: Option<String>,

    /// Base location for published outputs.
    #[arg(long)]
    pub output_uri: Option<String>,

    /// Name the job directory after the job only, without the id suffix.
    #[arg(long)]
    pub no_output_hash: bool,

    /// Force an exec method for a step, as STEP=METHOD (`default` for all).
    #[arg(long = "method", value_parser = parse_key_value)]
    pub methods: Vec<(String, String)>,
}

/// `NAME=VALUE` with a non-empty name.
fn parse_key_value(s: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{s}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty name in '{s}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Read a parameter value as a YAML scalar so `8` is a number and `true`
/// a boolean; anything unparsable stays a string.
fn parameter_value(raw: &str) -> serde_json::Value {
    match serde_yaml_ng::from_str::<serde_json::Value>(raw) {
        Ok(value @ (serde_json::Value::Number(_) | serde_json::Value::Bool(_))) => value,
        _ => serde_json::Value::String(raw.to_string()),
    }
}

/// Make bare relative paths absolute against `cwd`. Locations with a scheme
/// are left alone.
fn absolutize(location: &str, cwd: &Path) -> String {
    if location.contains("://") || location.starts_with("local:") || Path::new(location).is_absolute() {
        return location.to_string();
    }
    let trailing = if location.ends_with('/') { "/" } else { "" };
    let joined = cwd.join(location.trim_end_matches('/'));
    format!("{}{trailing}", joined.display())
}

/// Load the job file (if any) and layer the command-line options on top.
fn build_job(args: &RunArgs, cwd: &Path) -> Result<JobDefinition> {
    let mut job = match &args.job {
        Some(path) => load_job_file(path)
            .with_context(|| format!("Failed to load job file '{}'", path.display()))?,
        None => JobDefinition::default(),
    };

    if let Some(name) = &args.name {
        job.name = Some(name.clone());
    }
    if let Some(uri) = &args.work_uri {
        job.work_uri = Some(uri.clone());
    }
    if let Some(uri) = &args.output_uri {
        job.output_uri = Some(uri.clone());
    }
    if args.no_output_hash {
        job.no_output_hash = true;
    }
    for (name, value) in &args.inputs {
        job.inputs.insert(name.clone(), value.clone());
    }
    for (name, value) in &args.parameters {
        job.parameters.insert(name.clone(), parameter_value(value));
    }
    for (step, method) in &args.methods {
        job.execution.method.insert(step.clone(), method.clone());
    }

    for value in job.inputs.values_mut() {
        *value = absolutize(value, cwd);
    }
    job.work_uri = job.work_uri.map(|u| absolutize(&u, cwd));
    job.output_uri = job.output_uri.map(|u| absolutize(&u, cwd));
    Ok(job)
}

fn progress_message(report: &JobReport) -> String {
    let done = report
        .steps
        .iter()
        .filter(|s| s.status == StepStatus::Completed)
        .count();
    let running: Vec<&str> = report
        .steps
        .iter()
        .filter(|s| s.status == StepStatus::Running)
        .map(|s| s.name.as_str())
        .collect();
    if running.is_empty() {
        format!("{done}/{} steps done", report.steps.len())
    } else {
        format!(
            "{done}/{} steps done, running: {}",
            report.steps.len(),
            running.join(", ")
        )
    }
}

/// Run a workflow to a terminal status. Returns whether it COMPLETED.
pub async fn run(state: &AppState, args: RunArgs, json: bool, quiet: bool) -> Result<bool> {
    let workflow = load_workflow_file(&args.workflow)
        .with_context(|| format!("Failed to load workflow '{}'", args.workflow.display()))?;
    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    let job = build_job(&args, &cwd)?;

    let engine = &state.engine;
    let id = engine
        .run_job(&workflow, &job)
        .await
        .with_context(|| format!("Failed to start workflow '{}'", workflow.name))?;
    tracing::info!(job_id = %id, workflow = %workflow.name, "job submitted");

    let spinner = if json || quiet {
        ProgressBar::hidden()
    } else {
        ProgressBar::new_spinner()
    };
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .map_err(|e| anyhow!("invalid spinner template: {e}"))?,
    );
    spinner.set_message(format!("Running '{}'...", workflow.name));
    spinner.enable_steady_tick(Duration::from_millis(80));

    let poll = Duration::from_millis(engine.config().status_poll_ms.max(100));
    let mut ticker = tokio::time::interval(poll);
    let mut cancelling = false;
    let wait = engine.wait_job(&id);
    tokio::pin!(wait);

    let status = loop {
        tokio::select! {
            result = &mut wait => break result?,
            signal = tokio::signal::ctrl_c(), if !cancelling => {
                signal.context("Failed to listen for Ctrl+C")?;
                cancelling = true;
                spinner.set_message("Cancelling...");
                if let Err(e) = engine.cancel_job(&id).await {
                    tracing::warn!(job_id = %id, error = %e, "cancel request failed");
                }
            }
            _ = ticker.tick() => {
                if let Ok(report) = engine.job_status(&id).await {
                    spinner.set_message(progress_message(&report));
                }
            }
        }
    };
    spinner.finish_and_clear();

    let report = engine.job_status(&id).await?;
    if !quiet || json {
        print_report(&report, json)?;
    }
    Ok(status == JobStatus::Completed)
}

/// Validate a workflow and, when given, a job against it.
pub fn validate(workflow_path: &Path, job_path: Option<&Path>, json: bool) -> Result<()> {
    let workflow = load_workflow_file(workflow_path)
        .with_context(|| format!("Failed to load workflow '{}'", workflow_path.display()))?;
    let (order, methods) = match job_path {
        Some(path) => {
            let job = load_job_file(path)
                .with_context(|| format!("Failed to load job file '{}'", path.display()))?;
            let plan = prepare_job(&workflow, &job).context("Job does not fit the workflow")?;
            (plan.order, plan.methods)
        }
        None => (validate_workflow(&workflow)?, BTreeMap::new()),
    };

    if json {
        let out = serde_json::json!({
            "valid": true,
            "workflow": workflow.name,
            "version": workflow.version,
            "steps": order,
            "methods": methods,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Workflow '{}' v{} is valid",
        style("✓").green().bold(),
        style(&workflow.name).cyan(),
        workflow.version
    );
    println!();
    for (i, step) in order.iter().enumerate() {
        let app = workflow.steps.get(step).map(|s| s.app.as_str()).unwrap_or("-");
        match methods.get(step) {
            Some(method) => println!(
                "  {:>3}. {} {}",
                i + 1,
                step,
                style(format!("({app}, {method})")).dim()
            ),
            None => println!("  {:>3}. {} {}", i + 1, step, style(format!("({app})")).dim()),
        }
    }
    println!();
    Ok(())
}
