//! Status actor: the single writer of job and step status.
//!
//! Step workers never touch the repository directly. They send
//! [`StatusCommand`]s through a cloneable [`StatusHandle`]; one task owns
//! the repository writes and applies them in arrival order, replying on a
//! `oneshot` channel.

use std::sync::Arc;

use geneflow_types::error::RepositoryError;
use geneflow_types::job::{JobRecord, JobStatus, MapItemRecord, StepRecord, StepStatus};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::repository::job::{JobRepository, StepUpdate};

/// Buffer size for the status command channel.
const STATUS_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("status actor has stopped")]
    ActorStopped,

    #[error("illegal transition {from} -> {to} for step '{step}'")]
    IllegalTransition {
        step: String,
        from: StepStatus,
        to: StepStatus,
    },

    #[error("step '{step}' was not {expected}")]
    Conflict { step: String, expected: StepStatus },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

type Reply<T> = oneshot::Sender<Result<T, RepositoryError>>;

/// Messages accepted by the status actor.
#[derive(Debug)]
pub enum StatusCommand {
    CreateJob {
        job: Box<JobRecord>,
        steps: Vec<StepRecord>,
        reply: Reply<()>,
    },
    TransitionJob {
        id: Uuid,
        from: Vec<JobStatus>,
        to: JobStatus,
        error: Option<String>,
        reply: Reply<bool>,
    },
    TransitionStep {
        job_id: Uuid,
        step: String,
        from: StepStatus,
        to: StepStatus,
        update: StepUpdate,
        reply: Reply<bool>,
    },
    UpdateItems {
        job_id: Uuid,
        step: String,
        items: Vec<MapItemRecord>,
        reply: Reply<()>,
    },
}

/// Spawn the actor over `repo`. It runs until every handle is dropped.
pub fn spawn_status_actor<R: JobRepository + 'static>(
    repo: Arc<R>,
) -> (StatusHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<StatusCommand>(STATUS_BUFFER);
    let task = tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                StatusCommand::CreateJob { job, steps, reply } => {
                    let _ = reply.send(repo.create_job(&job, &steps).await);
                }
                StatusCommand::TransitionJob {
                    id,
                    from,
                    to,
                    error,
                    reply,
                } => {
                    let result = repo.transition_job(&id, &from, to, error.as_deref()).await;
                    tracing::debug!(job_id = %id, status = %to, applied = ?result.as_ref().ok(), "job transition");
                    let _ = reply.send(result);
                }
                StatusCommand::TransitionStep {
                    job_id,
                    step,
                    from,
                    to,
                    update,
                    reply,
                } => {
                    let result = repo.transition_step(&job_id, &step, from, to, &update).await;
                    tracing::debug!(%job_id, step = %step, status = %to, applied = ?result.as_ref().ok(), "step transition");
                    let _ = reply.send(result);
                }
                StatusCommand::UpdateItems {
                    job_id,
                    step,
                    items,
                    reply,
                } => {
                    let _ = reply.send(repo.update_step_items(&job_id, &step, &items).await);
                }
            }
        }
        tracing::debug!("status actor stopped");
    });
    (StatusHandle { tx }, task)
}

/// Cloneable sender side of the status actor.
#[derive(Debug, Clone)]
pub struct StatusHandle {
    tx: mpsc::Sender<StatusCommand>,
}

impl StatusHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> StatusCommand,
    ) -> Result<T, StatusError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| StatusError::ActorStopped)?;
        Ok(rx.await.map_err(|_| StatusError::ActorStopped)??)
    }

    pub async fn create_job(&self, job: JobRecord, steps: Vec<StepRecord>) -> Result<(), StatusError> {
        self.request(|reply| StatusCommand::CreateJob {
            job: Box::new(job),
            steps,
            reply,
        })
        .await
    }

    /// Compare-and-set a job's status. Returns whether it was applied.
    pub async fn transition_job(
        &self,
        id: Uuid,
        from: &[JobStatus],
        to: JobStatus,
        error: Option<String>,
    ) -> Result<bool, StatusError> {
        self.request(|reply| StatusCommand::TransitionJob {
            id,
            from: from.to_vec(),
            to,
            error,
            reply,
        })
        .await
    }

    /// Move a step along its state machine. Illegal transitions are
    /// rejected before reaching the store; a lost compare-and-set is a
    /// `Conflict`.
    pub async fn transition_step(
        &self,
        job_id: Uuid,
        step: &str,
        from: StepStatus,
        to: StepStatus,
        update: StepUpdate,
    ) -> Result<(), StatusError> {
        if !from.can_transition_to(to) {
            return Err(StatusError::IllegalTransition {
                step: step.to_string(),
                from,
                to,
            });
        }
        let applied = self
            .request(|reply| StatusCommand::TransitionStep {
                job_id,
                step: step.to_string(),
                from,
                to,
                update,
                reply,
            })
            .await?;
        if applied {
            Ok(())
        } else {
            Err(StatusError::Conflict {
                step: step.to_string(),
                expected: from,
            })
        }
    }

    pub async fn update_items(
        &self,
        job_id: Uuid,
        step: &str,
        items: Vec<MapItemRecord>,
    ) -> Result<(), StatusError> {
        self.request(|reply| StatusCommand::UpdateItems {
            job_id,
            step: step.to_string(),
            items,
            reply,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{InMemoryJobRepository, job_record};

    #[tokio::test]
    async fn test_step_transitions_are_checked_and_serialized() {
        let repo = Arc::new(InMemoryJobRepository::default());
        let (status, _task) = spawn_status_actor(Arc::clone(&repo));
        let job = job_record("demo");
        let id = job.id;
        status
            .create_job(job, vec![StepRecord::pending(id, "index", 1)])
            .await
            .unwrap();

        let err = status
            .transition_step(id, "index", StepStatus::Pending, StepStatus::Completed, StepUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StatusError::IllegalTransition { .. }), "got: {err:?}");

        status
            .transition_step(id, "index", StepStatus::Pending, StepStatus::Running, StepUpdate::default())
            .await
            .unwrap();

        // A second start loses the compare-and-set.
        let err = status
            .transition_step(id, "index", StepStatus::Pending, StepStatus::Running, StepUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StatusError::Conflict { .. }), "got: {err:?}");

        let update = StepUpdate {
            output_uri: Some("local:/work/index".into()),
            ..Default::default()
        };
        status
            .transition_step(id, "index", StepStatus::Running, StepStatus::Completed, update)
            .await
            .unwrap();
        let steps = repo.list_steps(&id).await.unwrap();
        assert_eq!(steps[0].status, StepStatus::Completed);
        assert_eq!(steps[0].output_uri.as_deref(), Some("local:/work/index"));
        assert!(steps[0].finished_at.is_some());
    }

    #[tokio::test]
    async fn test_job_transition_reports_cas_result() {
        let repo = Arc::new(InMemoryJobRepository::default());
        let (status, _task) = spawn_status_actor(Arc::clone(&repo));
        let job = job_record("demo");
        let id = job.id;
        status.create_job(job, vec![]).await.unwrap();

        assert!(status
            .transition_job(id, &[JobStatus::Pending], JobStatus::Running, None)
            .await
            .unwrap());
        assert!(!status
            .transition_job(id, &[JobStatus::Pending], JobStatus::Running, None)
            .await
            .unwrap());
        assert_eq!(
            repo.get_job(&id).await.unwrap().unwrap().status,
            JobStatus::Running
        );
    }
}
