//! SQLite job repository implementation.
//!
//! Implements `JobRepository` from `geneflow-core` using sqlx with split
//! read/write pools. Status changes are compare-and-set updates: the
//! `WHERE status IN (...)` clause decides whether a transition applies.

use geneflow_core::repository::job::{JobRepository, StepUpdate};
use geneflow_types::error::RepositoryError;
use geneflow_types::job::{JobRecord, JobStatus, MapItemRecord, StepRecord, StepStatus};
use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `JobRepository`.
pub struct SqliteJobRepository {
    pool: DatabasePool,
}

impl SqliteJobRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct JobRow {
    id: String,
    name: String,
    workflow_id: String,
    workflow_name: String,
    workflow_version: String,
    status: String,
    inputs: String,
    parameters: String,
    work_uri: String,
    output_uri: String,
    error: Option<String>,
    queued_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            workflow_id: row.try_get("workflow_id")?,
            workflow_name: row.try_get("workflow_name")?,
            workflow_version: row.try_get("workflow_version")?,
            status: row.try_get("status")?,
            inputs: row.try_get("inputs")?,
            parameters: row.try_get("parameters")?,
            work_uri: row.try_get("work_uri")?,
            output_uri: row.try_get("output_uri")?,
            error: row.try_get("error")?,
            queued_at: row.try_get("queued_at")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }

    fn into_record(self) -> Result<JobRecord, RepositoryError> {
        Ok(JobRecord {
            id: parse_uuid(&self.id)?,
            name: self.name,
            workflow_id: parse_uuid(&self.workflow_id)?,
            workflow_name: self.workflow_name,
            workflow_version: self.workflow_version,
            status: parse_status(&self.status, "job")?,
            inputs: serde_json::from_str(&self.inputs)
                .map_err(|e| RepositoryError::Query(format!("invalid job inputs: {e}")))?,
            parameters: serde_json::from_str(&self.parameters)
                .map_err(|e| RepositoryError::Query(format!("invalid job parameters: {e}")))?,
            work_uri: self.work_uri,
            output_uri: self.output_uri,
            error: self.error,
            queued_at: parse_datetime(&self.queued_at)?,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            finished_at: self.finished_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

struct StepRow {
    job_id: String,
    name: String,
    number: i64,
    status: String,
    items: String,
    output_uri: Option<String>,
    error: Option<String>,
    started_at: Option<String>,
    finished_at: Option<String>,
}

impl StepRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            job_id: row.try_get("job_id")?,
            name: row.try_get("name")?,
            number: row.try_get("number")?,
            status: row.try_get("status")?,
            items: row.try_get("items")?,
            output_uri: row.try_get("output_uri")?,
            error: row.try_get("error")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }

    fn into_record(self) -> Result<StepRecord, RepositoryError> {
        Ok(StepRecord {
            job_id: parse_uuid(&self.job_id)?,
            name: self.name,
            number: u32::try_from(self.number)
                .map_err(|_| RepositoryError::Query(format!("invalid step number: {}", self.number)))?,
            status: parse_status(&self.status, "step")?,
            items: serde_json::from_str(&self.items)
                .map_err(|e| RepositoryError::Query(format!("invalid step items: {e}")))?,
            output_uri: self.output_uri,
            error: self.error,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            finished_at: self.finished_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_status<T: serde::de::DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| RepositoryError::Query(format!("invalid {what} status: {s}")))
}

fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

/// `?, ?, ...` for an `IN` list of `n` values.
fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

// ---------------------------------------------------------------------------
// JobRepository impl
// ---------------------------------------------------------------------------

impl JobRepository for SqliteJobRepository {
    async fn create_job(&self, job: &JobRecord, steps: &[StepRecord]) -> Result<(), RepositoryError> {
        let inputs = serde_json::to_string(&job.inputs)
            .map_err(|e| RepositoryError::Query(format!("serialize inputs: {e}")))?;
        let parameters = serde_json::to_string(&job.parameters)
            .map_err(|e| RepositoryError::Query(format!("serialize parameters: {e}")))?;

        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        sqlx::query(
            r#"INSERT INTO jobs
               (id, name, workflow_id, workflow_name, workflow_version, status, inputs,
                parameters, work_uri, output_uri, error, queued_at, started_at, finished_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(job.id.to_string())
        .bind(&job.name)
        .bind(job.workflow_id.to_string())
        .bind(&job.workflow_name)
        .bind(&job.workflow_version)
        .bind(job.status.as_str())
        .bind(&inputs)
        .bind(&parameters)
        .bind(&job.work_uri)
        .bind(&job.output_uri)
        .bind(&job.error)
        .bind(format_datetime(&job.queued_at))
        .bind(job.started_at.as_ref().map(format_datetime))
        .bind(job.finished_at.as_ref().map(format_datetime))
        .execute(&mut *tx)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                RepositoryError::Conflict(format!("job {} already exists", job.id))
            }
            _ => query_error(e),
        })?;

        for step in steps {
            let items = serde_json::to_string(&step.items)
                .map_err(|e| RepositoryError::Query(format!("serialize items: {e}")))?;
            sqlx::query(
                r#"INSERT INTO job_steps (job_id, name, number, status, items)
                   VALUES (?, ?, ?, ?, ?)"#,
            )
            .bind(job.id.to_string())
            .bind(&step.name)
            .bind(i64::from(step.number))
            .bind(step.status.as_str())
            .bind(&items)
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;
        }

        tx.commit().await.map_err(query_error)?;
        Ok(())
    }

    async fn get_job(&self, id: &Uuid) -> Result<Option<JobRecord>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = JobRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_record()?))
            }
            None => Ok(None),
        }
    }

    async fn list_jobs(&self, limit: u32) -> Result<Vec<JobRecord>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM jobs ORDER BY queued_at DESC LIMIT ?")
            .bind(i64::from(limit))
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in &rows {
            jobs.push(JobRow::from_row(row).map_err(query_error)?.into_record()?);
        }
        Ok(jobs)
    }

    async fn list_steps(&self, job_id: &Uuid) -> Result<Vec<StepRecord>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM job_steps WHERE job_id = ? ORDER BY number ASC")
            .bind(job_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        let mut steps = Vec::with_capacity(rows.len());
        for row in &rows {
            steps.push(StepRow::from_row(row).map_err(query_error)?.into_record()?);
        }
        Ok(steps)
    }

    async fn transition_job(
        &self,
        id: &Uuid,
        from: &[JobStatus],
        to: JobStatus,
        error: Option<&str>,
    ) -> Result<bool, RepositoryError> {
        if from.is_empty() {
            return Ok(false);
        }
        let now = format_datetime(&Utc::now());
        let started_at = (to == JobStatus::Running).then(|| now.clone());
        let finished_at = to.is_terminal().then_some(now);

        let sql = format!(
            "UPDATE jobs SET status = ?, error = COALESCE(?, error), \
             started_at = COALESCE(?, started_at), finished_at = COALESCE(?, finished_at) \
             WHERE id = ? AND status IN ({})",
            placeholders(from.len())
        );
        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(error)
            .bind(started_at)
            .bind(finished_at)
            .bind(id.to_string());
        for status in from {
            query = query.bind(status.as_str());
        }
        let result = query.execute(&self.pool.writer).await.map_err(query_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn transition_step(
        &self,
        job_id: &Uuid,
        step: &str,
        from: StepStatus,
        to: StepStatus,
        update: &StepUpdate,
    ) -> Result<bool, RepositoryError> {
        let now = format_datetime(&Utc::now());
        let started_at = (to == StepStatus::Running).then(|| now.clone());
        let finished_at = to.is_terminal().then_some(now);

        let result = sqlx::query(
            r#"UPDATE job_steps SET status = ?,
                 error = COALESCE(?, error),
                 output_uri = COALESCE(?, output_uri),
                 started_at = COALESCE(?, started_at),
                 finished_at = COALESCE(?, finished_at)
               WHERE job_id = ? AND name = ? AND status = ?"#,
        )
        .bind(to.as_str())
        .bind(&update.error)
        .bind(&update.output_uri)
        .bind(started_at)
        .bind(finished_at)
        .bind(job_id.to_string())
        .bind(step)
        .bind(from.as_str())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_step_items(
        &self,
        job_id: &Uuid,
        step: &str,
        items: &[MapItemRecord],
    ) -> Result<(), RepositoryError> {
        let items = serde_json::to_string(items)
            .map_err(|e| RepositoryError::Query(format!("serialize items: {e}")))?;
        let result = sqlx::query("UPDATE job_steps SET items = ? WHERE job_id = ? AND name = ?")
            .bind(&items)
            .bind(job_id.to_string())
            .bind(step)
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }
}
