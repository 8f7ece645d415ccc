//! Job repository trait definition.

use geneflow_types::error::RepositoryError;
use geneflow_types::job::{JobRecord, JobStatus, MapItemRecord, StepRecord, StepStatus};
use uuid::Uuid;

/// Optional fields written together with a step transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepUpdate {
    pub error: Option<String>,
    pub output_uri: Option<String>,
}

/// Durable job and step status storage.
///
/// Every status change is a compare-and-set: it applies only when the row's
/// current status is one of the expected ones, and reports whether it did.
/// Implementations set `started_at` on entry to RUNNING and `finished_at`
/// on entry to a terminal status.
pub trait JobRepository: Send + Sync {
    /// Insert a job together with its (PENDING) step rows.
    fn create_job(
        &self,
        job: &JobRecord,
        steps: &[StepRecord],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_job(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<JobRecord>, RepositoryError>> + Send;

    /// Most recently queued jobs first.
    fn list_jobs(
        &self,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<JobRecord>, RepositoryError>> + Send;

    /// Steps of a job, ordered by step number.
    fn list_steps(
        &self,
        job_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StepRecord>, RepositoryError>> + Send;

    /// Move a job from any of `from` to `to`. Returns `false` when the job
    /// was not in one of the expected states.
    fn transition_job(
        &self,
        id: &Uuid,
        from: &[JobStatus],
        to: JobStatus,
        error: Option<&str>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Move a step from `from` to `to`. Returns `false` when the step was
    /// not in `from`.
    fn transition_step(
        &self,
        job_id: &Uuid,
        step: &str,
        from: StepStatus,
        to: StepStatus,
        update: &StepUpdate,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Replace the per-item records of a step.
    fn update_step_items(
        &self,
        job_id: &Uuid,
        step: &str,
        items: &[MapItemRecord],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
