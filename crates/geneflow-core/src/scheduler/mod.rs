//! Job scheduling engine.
//!
//! [`Engine`] accepts jobs, validates them, persists PENDING rows through
//! the status actor, and spawns one driver task per job. All invocations of
//! all jobs share one worker pool of `max_concurrency` permits.
//!
//! Steps in the `local` execution context run on the engine's own process
//! host. Other contexts run on hosts registered with
//! [`Engine::register_context`]; a job naming an unregistered context is
//! rejected before anything is written.

pub mod driver;
pub mod status;
pub mod step;

use std::sync::Arc;

use dashmap::DashMap;
use geneflow_types::config::EngineConfig;
use geneflow_types::definition::{DEFAULT_CONTEXT, WorkflowDefinition};
use geneflow_types::error::{LocatorError, RepositoryError};
use geneflow_types::job::{JobDefinition, JobRecord, JobReport, JobStatus, StepRecord};
use geneflow_types::slug::slugify;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::command::{EnvironmentProbe, ProcessHost};
use crate::dag::{GraphValidationError, prepare_job};
use crate::data::DataManager;
use crate::locator::{Locator, Scheme};
use crate::repository::job::JobRepository;

use self::driver::{JobRun, drive};
use self::status::{StatusError, StatusHandle, spawn_status_actor};

pub use self::step::StepError;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] GraphValidationError),

    #[error("invalid {which} location: {source}")]
    Location {
        which: &'static str,
        #[source]
        source: LocatorError,
    },

    #[error("no {0} location configured")]
    MissingLocation(&'static str),

    #[error("no data backend for {which} scheme '{scheme}'")]
    UnsupportedScheme { which: String, scheme: Scheme },

    #[error(transparent)]
    Status(#[from] StatusError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    #[error("job {0} is not active in this engine")]
    JobNotActive(Uuid),

    #[error("job driver failed: {0}")]
    Driver(String),
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// Services shared by the drivers and step workers of every job.
pub(crate) struct Runtime<H, P> {
    pub(crate) status: StatusHandle,
    pub(crate) data: Arc<DataManager>,
    /// Host of the `local` context.
    pub(crate) host: Arc<H>,
    /// Hosts of every other execution context, keyed by context name.
    pub(crate) contexts: DashMap<String, Arc<dyn ProcessHost>>,
    pub(crate) probe: Arc<P>,
    pub(crate) workers: Arc<Semaphore>,
    pub(crate) config: EngineConfig,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct EngineInner<R, H, P> {
    repo: Arc<R>,
    runtime: Arc<Runtime<H, P>>,
    /// Cancellation tokens of jobs driven by this engine, keyed by job id.
    cancellation_tokens: DashMap<Uuid, CancellationToken>,
    drivers: DashMap<Uuid, JoinHandle<JobStatus>>,
}

/// Workflow engine over a job store `R`, a process host `H`, and an
/// environment probe `P`. Cheap to clone.
pub struct Engine<R, H, P> {
    inner: Arc<EngineInner<R, H, P>>,
}

impl<R, H, P> Clone for Engine<R, H, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R, H, P> Engine<R, H, P>
where
    R: JobRepository + 'static,
    H: ProcessHost + 'static,
    P: EnvironmentProbe + 'static,
{
    /// Build an engine. Must be called inside a tokio runtime: the status
    /// actor is spawned here.
    pub fn new(repo: Arc<R>, data: DataManager, host: H, probe: P, config: EngineConfig) -> Self {
        let (status, _actor) = spawn_status_actor(Arc::clone(&repo));
        let workers = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            inner: Arc::new(EngineInner {
                repo,
                runtime: Arc::new(Runtime {
                    status,
                    data: Arc::new(data),
                    host: Arc::new(host),
                    contexts: DashMap::new(),
                    probe: Arc::new(probe),
                    workers,
                    config,
                }),
                cancellation_tokens: DashMap::new(),
                drivers: DashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.runtime.config
    }

    /// Run steps whose execution context is `name` on `host`. Registering
    /// `local` has no effect; it always uses the engine's own host.
    pub fn register_context(&self, name: &str, host: impl ProcessHost + 'static) {
        if name == DEFAULT_CONTEXT {
            tracing::warn!("ignoring host registered for the local context");
            return;
        }
        tracing::debug!(context = name, "execution context registered");
        self.inner
            .runtime
            .contexts
            .insert(name.to_string(), Arc::new(host));
    }

    /// Names of the execution contexts steps may use, `local` first.
    pub fn contexts(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .runtime
            .contexts
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names.insert(0, DEFAULT_CONTEXT.to_string());
        names
    }

    /// Validate `job` against `workflow`, persist it as PENDING, and start
    /// driving it. Nothing is written when validation fails.
    pub async fn run_job(
        &self,
        workflow: &WorkflowDefinition,
        job: &JobDefinition,
    ) -> Result<Uuid, EngineError> {
        let plan = prepare_job(workflow, job)?;
        plan.check_contexts(|context| self.inner.runtime.contexts.contains_key(context))?;
        let config = &self.inner.runtime.config;

        let id = Uuid::now_v7();
        let name = job.name.clone().unwrap_or_else(|| workflow.name.clone());
        let dir_name = if job.no_output_hash {
            slugify(&name)
        } else {
            let hex = id.simple().to_string();
            format!("{}-{}", slugify(&name), &hex[hex.len() - 8..])
        };
        let work = job_location("work", job.work_uri.as_ref().or(config.work_uri.as_ref()), &dir_name)?;
        let output = job_location(
            "output",
            job.output_uri.as_ref().or(config.output_uri.as_ref()),
            &dir_name,
        )?;
        let data = &self.inner.runtime.data;
        let locations = [("work".to_string(), &work), ("output".to_string(), &output)]
            .into_iter()
            .chain(plan.values.inputs.iter().map(|(name, l)| (format!("input '{name}'"), l)));
        for (which, location) in locations {
            if !data.supports(location.scheme()) {
                return Err(EngineError::UnsupportedScheme {
                    which,
                    scheme: location.scheme(),
                });
            }
        }

        let record = JobRecord {
            id,
            name: name.clone(),
            workflow_id: workflow.id,
            workflow_name: workflow.name.clone(),
            workflow_version: workflow.version.clone(),
            status: JobStatus::Pending,
            inputs: plan
                .values
                .inputs
                .iter()
                .map(|(k, v)| (k.clone(), v.serialize()))
                .collect(),
            parameters: plan.values.parameters.clone(),
            work_uri: work.serialize(),
            output_uri: output.serialize(),
            error: None,
            queued_at: chrono::Utc::now(),
            started_at: None,
            finished_at: None,
        };
        let steps: Vec<StepRecord> = plan
            .order
            .iter()
            .enumerate()
            .map(|(i, step)| StepRecord::pending(id, step, i as u32 + 1))
            .collect();
        self.inner.runtime.status.create_job(record, steps).await?;

        tracing::info!(
            job_id = %id,
            job = %name,
            workflow = %workflow.name,
            steps = plan.order.len(),
            "job queued"
        );

        let cancel = CancellationToken::new();
        self.inner.cancellation_tokens.insert(id, cancel.clone());
        let run = JobRun {
            id,
            workflow: Arc::new(workflow.clone()),
            plan,
            work,
            output,
            cancel,
        };

        let poll = std::time::Duration::from_millis(config.status_poll_ms.max(10));
        let watcher = tokio::spawn(watch_store_cancel(
            Arc::clone(&self.inner.repo),
            id,
            run.cancel.clone(),
            poll,
        ));
        let runtime = Arc::clone(&self.inner.runtime);
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let status = drive(runtime, run).await;
            watcher.abort();
            inner.cancellation_tokens.remove(&id);
            status
        });
        self.inner.drivers.insert(id, handle);
        Ok(id)
    }

    /// Job row plus step rows.
    pub async fn job_status(&self, id: &Uuid) -> Result<JobReport, EngineError> {
        let job = self
            .inner
            .repo
            .get_job(id)
            .await?
            .ok_or(EngineError::JobNotFound(*id))?;
        let steps = self.inner.repo.list_steps(id).await?;
        Ok(JobReport { job, steps })
    }

    pub async fn list_jobs(&self, limit: u32) -> Result<Vec<JobRecord>, EngineError> {
        Ok(self.inner.repo.list_jobs(limit).await?)
    }

    /// Cancel a job.
    ///
    /// A job driven by this engine has its token tripped. A job driven
    /// elsewhere is marked CANCELLED in the store; its driver notices on
    /// its next status poll.
    pub async fn cancel_job(&self, id: &Uuid) -> Result<(), EngineError> {
        if let Some(token) = self.inner.cancellation_tokens.get(id) {
            tracing::info!(job_id = %id, "cancelling job");
            token.cancel();
            return Ok(());
        }
        if self.inner.repo.get_job(id).await?.is_none() {
            return Err(EngineError::JobNotFound(*id));
        }
        let applied = self
            .inner
            .runtime
            .status
            .transition_job(
                *id,
                &[JobStatus::Pending, JobStatus::Running],
                JobStatus::Cancelled,
                Some("cancelled".to_string()),
            )
            .await?;
        if !applied {
            return Err(EngineError::JobNotActive(*id));
        }
        tracing::info!(job_id = %id, "job marked cancelled in store");
        Ok(())
    }

    /// Wait for a job started by this engine. A job that already finished
    /// reports its stored status.
    pub async fn wait_job(&self, id: &Uuid) -> Result<JobStatus, EngineError> {
        if let Some((_, handle)) = self.inner.drivers.remove(id) {
            return handle.await.map_err(|e| EngineError::Driver(e.to_string()));
        }
        let job = self
            .inner
            .repo
            .get_job(id)
            .await?
            .ok_or(EngineError::JobNotFound(*id))?;
        if job.status.is_terminal() {
            Ok(job.status)
        } else {
            Err(EngineError::JobNotActive(*id))
        }
    }
}

/// Trip `cancel` once the job's stored status becomes CANCELLED, which is
/// how a cancel issued from another process reaches this driver.
async fn watch_store_cancel<R: JobRepository>(
    repo: Arc<R>,
    id: Uuid,
    cancel: CancellationToken,
    poll: std::time::Duration,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(poll) => {}
        }
        match repo.get_job(&id).await {
            Ok(Some(job)) if job.status == JobStatus::Cancelled => {
                tracing::info!(job_id = %id, "job cancelled in store");
                cancel.cancel();
                return;
            }
            Ok(Some(job)) if job.status.is_terminal() => return,
            Ok(_) => {}
            Err(e) => tracing::debug!(job_id = %id, error = %e, "status poll failed"),
        }
    }
}

/// `<base>/<dir_name>/` for a configured base location.
fn job_location(
    which: &'static str,
    base: Option<&String>,
    dir_name: &str,
) -> Result<Locator, EngineError> {
    let base = base.ok_or(EngineError::MissingLocation(which))?;
    Locator::parse(base)
        .and_then(|b| b.join(dir_name))
        .map(|l| l.as_directory())
        .map_err(|source| EngineError::Location { which, source })
}
