//! Job inspection subcommands: status, list, cancel.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use uuid::Uuid;

use geneflow_types::job::{JobRecord, JobReport, JobStatus, StepRecord, StepStatus};

use crate::state::AppState;

fn parse_job_id(s: &str) -> Result<Uuid> {
    s.parse().with_context(|| format!("Invalid job ID: '{s}'"))
}

fn format_job_status(status: JobStatus) -> Cell {
    let cell = Cell::new(status.to_string());
    match status {
        JobStatus::Pending => cell.fg(Color::Yellow),
        JobStatus::Running => cell.fg(Color::Blue),
        JobStatus::Completed => cell.fg(Color::Green),
        JobStatus::Failed => cell.fg(Color::Red),
        JobStatus::Cancelled => cell.fg(Color::DarkYellow),
    }
}

fn format_step_status(status: StepStatus) -> Cell {
    let cell = Cell::new(status.to_string());
    match status {
        StepStatus::Pending => cell.fg(Color::Yellow),
        StepStatus::Running => cell.fg(Color::Blue),
        StepStatus::Completed => cell.fg(Color::Green),
        StepStatus::Failed => cell.fg(Color::Red),
    }
}

fn format_time(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// `done/total` over a step's map items.
fn item_progress(step: &StepRecord) -> String {
    if step.items.is_empty() {
        return "-".to_string();
    }
    let done = step
        .items
        .iter()
        .filter(|i| i.status == StepStatus::Completed)
        .count();
    format!("{done}/{}", step.items.len())
}

/// Print a job with its step table, or the whole report as JSON.
pub fn print_report(report: &JobReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    let job = &report.job;
    println!();
    println!(
        "  {} {} ({})",
        style("Job:").bold(),
        style(&job.name).cyan(),
        job.id
    );
    println!(
        "  Workflow: {} v{}",
        style(&job.workflow_name).cyan(),
        job.workflow_version
    );
    let status = match job.status {
        JobStatus::Completed => style(job.status.to_string()).green(),
        JobStatus::Failed => style(job.status.to_string()).red(),
        JobStatus::Cancelled => style(job.status.to_string()).yellow(),
        _ => style(job.status.to_string()).blue(),
    };
    println!("  Status: {status}");
    println!("  Work: {}", job.work_uri);
    println!("  Output: {}", job.output_uri);
    println!("  Started: {}", format_time(job.started_at));
    println!("  Finished: {}", format_time(job.finished_at));
    if let Some(ref err) = job.error {
        println!("  Error: {}", style(err).red());
    }
    println!();

    if report.steps.is_empty() {
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("#").fg(Color::Cyan),
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Items"),
            Cell::new("Error"),
        ]);
    for step in &report.steps {
        let error = step
            .error
            .as_deref()
            .and_then(|e| e.lines().next())
            .unwrap_or("");
        table.add_row(vec![
            Cell::new(step.number),
            Cell::new(&step.name),
            format_step_status(step.status),
            Cell::new(item_progress(step)),
            Cell::new(error),
        ]);
    }
    println!("{table}");
    println!();
    Ok(())
}

/// `gf status <job-id>`.
pub async fn status(state: &AppState, job_id: &str, json: bool) -> Result<()> {
    let id = parse_job_id(job_id)?;
    let report = state.engine.job_status(&id).await?;
    print_report(&report, json)
}

/// `gf list`.
pub async fn list(state: &AppState, limit: u32, json: bool) -> Result<()> {
    let jobs: Vec<JobRecord> = state.engine.list_jobs(limit).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }

    if jobs.is_empty() {
        println!();
        println!("  No jobs yet.");
        println!(
            "  Start one with: {}",
            style("gf run <workflow.yaml> -i name=location").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Job ID").fg(Color::Cyan),
            Cell::new("Name"),
            Cell::new("Workflow"),
            Cell::new("Status"),
            Cell::new("Queued"),
            Cell::new("Finished"),
        ]);
    for job in &jobs {
        table.add_row(vec![
            Cell::new(job.id),
            Cell::new(&job.name),
            Cell::new(format!("{} v{}", job.workflow_name, job.workflow_version)),
            format_job_status(job.status),
            Cell::new(job.queued_at.format("%Y-%m-%d %H:%M").to_string()),
            Cell::new(format_time(job.finished_at)),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

/// `gf cancel <job-id>`.
pub async fn cancel(state: &AppState, job_id: &str, json: bool) -> Result<()> {
    let id = parse_job_id(job_id)?;
    state
        .engine
        .cancel_job(&id)
        .await
        .with_context(|| format!("Failed to cancel job {id}"))?;

    if json {
        let out = serde_json::json!({ "job_id": id.to_string(), "cancelled": true });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!("  {} Job {} cancelled", style("✓").green().bold(), style(id).cyan());
        println!();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use geneflow_types::job::MapItemRecord;

    use super::*;

    fn item(status: StepStatus) -> MapItemRecord {
        MapItemRecord {
            filename: "a_R1.fastq".into(),
            status,
            attempt: 1,
            template: BTreeMap::new(),
            exec_method: None,
            exit_code: None,
            error: None,
        }
    }

    #[test]
    fn test_parse_job_id() {
        let id = Uuid::now_v7();
        assert_eq!(parse_job_id(&id.to_string()).unwrap(), id);
        let err = parse_job_id("not-a-uuid").unwrap_err();
        assert!(err.to_string().contains("Invalid job ID"), "got: {err:?}");
    }

    #[test]
    fn test_item_progress() {
        let mut step = StepRecord::pending(Uuid::now_v7(), "align", 2);
        assert_eq!(item_progress(&step), "-");
        step.items = vec![
            item(StepStatus::Completed),
            item(StepStatus::Running),
            item(StepStatus::Completed),
        ];
        assert_eq!(item_progress(&step), "2/3");
    }

    #[test]
    fn test_format_time() {
        assert_eq!(format_time(None), "-");
        let t = DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(format_time(Some(t)), "2026-01-02 03:04:05");
    }
}
