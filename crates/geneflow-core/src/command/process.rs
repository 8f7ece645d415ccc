//! Process host port: the spawn/monitor primitive behind command execution.
//!
//! Hosts run one [`Pipeline`] at a time, either to completion (`invoke`)
//! or in the background (`spawn`), returning a [`ProcessHandle`] that can
//! be polled, awaited, or terminated. The OS-backed host lives in
//! geneflow-infra.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::plan::Pipeline;

/// Failure to start (or wire up) a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvocationError {
    #[error("pipeline has no commands")]
    EmptyPipeline,

    #[error("failed to start '{program}': {reason}")]
    Spawn { program: String, reason: String },

    #[error("failed to open redirect '{path}': {reason}")]
    Redirect { path: String, reason: String },

    #[error("failed to write job script '{path}': {reason}")]
    Script { path: String, reason: String },
}

/// Terminal state of one pipeline (or an aggregated plan).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InvocationOutcome {
    /// Exit code of the last command, when it exited normally.
    pub exit_code: Option<i32>,
    pub success: bool,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl InvocationOutcome {
    pub fn succeeded() -> Self {
        Self {
            exit_code: Some(0),
            success: true,
            ..Default::default()
        }
    }

    pub fn exited(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            success: code == 0,
            ..Default::default()
        }
    }

    pub fn timed_out() -> Self {
        Self {
            timed_out: true,
            ..Default::default()
        }
    }

    pub fn cancelled() -> Self {
        Self {
            cancelled: true,
            ..Default::default()
        }
    }

    /// Short human-readable description, used in step error messages.
    pub fn describe(&self) -> String {
        if self.cancelled {
            "cancelled".to_string()
        } else if self.timed_out {
            "timed out".to_string()
        } else {
            match self.exit_code {
                Some(code) => format!("exit code {code}"),
                None => "terminated by signal".to_string(),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ProcessHandle
// ---------------------------------------------------------------------------

/// A running pipeline.
///
/// The monitor task owns the child processes; tripping the handle's token
/// makes it kill them and resolve as cancelled.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    stop: CancellationToken,
    task: JoinHandle<InvocationOutcome>,
}

impl ProcessHandle {
    pub fn new(pid: Option<u32>, stop: CancellationToken, task: JoinHandle<InvocationOutcome>) -> Self {
        Self { pid, stop, task }
    }

    /// OS pid of the last command in the pipeline, if known.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Ask the monitor to kill the pipeline. Idempotent.
    pub fn terminate(&self) {
        self.stop.cancel();
    }

    /// A token that terminates this pipeline when cancelled.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Wait for the pipeline to reach a terminal state.
    pub async fn wait(self) -> InvocationOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(pid = ?self.pid, error = %e, "process monitor task failed");
                InvocationOutcome::default()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ProcessHost trait
// ---------------------------------------------------------------------------

/// OS-level process creation and monitoring.
///
/// Object safe, so hosts for different execution contexts can sit behind
/// one `Arc<dyn ProcessHost>` registry.
pub trait ProcessHost: Send + Sync {
    /// Start `pipeline` in the background. The optional timeout is enforced
    /// by the monitor, which kills the pipeline and reports `timed_out`.
    fn spawn(
        &self,
        pipeline: &Pipeline,
        timeout: Option<Duration>,
    ) -> Result<ProcessHandle, InvocationError>;

    /// Run `pipeline` to completion. A non-zero exit is reported through
    /// the outcome, not as an error.
    fn invoke(
        &self,
        pipeline: &Pipeline,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<InvocationOutcome, InvocationError>> + Send
    where
        Self: Sized,
    {
        let spawned = self.spawn(pipeline, timeout);
        async move { Ok(spawned?.wait().await) }
    }
}
