//! Running an [`ExecutablePlan`] on a [`ProcessHost`].

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::plan::{ExecutablePlan, Pipeline, PlanStep};
use super::process::{InvocationError, InvocationOutcome, ProcessHost};

type StepFuture<'a> =
    Pin<Box<dyn Future<Output = Result<InvocationOutcome, InvocationError>> + Send + 'a>>;

/// Run a plan to completion.
///
/// Top-level steps stop at the first failure; groups run every member and
/// report the first failing member. Cancelling `cancel` terminates the
/// running pipeline and prevents further ones from starting. A start
/// failure at the top level is returned as an error.
pub async fn execute<H: ProcessHost + ?Sized>(
    host: &H,
    plan: &ExecutablePlan,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<InvocationOutcome, InvocationError> {
    let mut last = InvocationOutcome::succeeded();
    for step in &plan.steps {
        let outcome = run_step(host, step, timeout, cancel).await?;
        if !outcome.success {
            return Ok(outcome);
        }
        last = outcome;
    }
    Ok(last)
}

fn run_step<'a, H: ProcessHost + ?Sized>(
    host: &'a H,
    step: &'a PlanStep,
    timeout: Option<Duration>,
    cancel: &'a CancellationToken,
) -> StepFuture<'a> {
    Box::pin(async move {
        match step {
            PlanStep::Run(pipeline) => run_pipeline(host, pipeline, timeout, cancel).await,
            PlanStep::Group(members) => {
                let mut aggregate = InvocationOutcome::succeeded();
                for member in members {
                    let outcome = match run_step(host, member, timeout, cancel).await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            tracing::warn!(error = %e, "group member failed to start");
                            InvocationOutcome::default()
                        }
                    };
                    if outcome.cancelled {
                        return Ok(outcome);
                    }
                    if !outcome.success && aggregate.success {
                        aggregate = outcome;
                    }
                }
                Ok(aggregate)
            }
        }
    })
}

async fn run_pipeline<H: ProcessHost + ?Sized>(
    host: &H,
    pipeline: &Pipeline,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<InvocationOutcome, InvocationError> {
    if cancel.is_cancelled() {
        return Ok(InvocationOutcome::cancelled());
    }

    let handle = host.spawn(pipeline, timeout)?;
    tracing::debug!(
        pid = ?handle.pid(),
        command = %pipeline.commands.iter().map(|c| c.display()).collect::<Vec<_>>().join(" | "),
        "spawned pipeline"
    );

    let stop = handle.stop_token();
    let waiter = handle.wait();
    tokio::pin!(waiter);

    tokio::select! {
        outcome = &mut waiter => Ok(outcome),
        _ = cancel.cancelled() => {
            stop.cancel();
            let mut outcome = waiter.await;
            outcome.cancelled = true;
            outcome.success = false;
            Ok(outcome)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::plan::{ProcessSpec, Redirect};
    use crate::testing::ScriptedHost;

    fn run(program: &str) -> PlanStep {
        PlanStep::Run(Pipeline {
            commands: vec![ProcessSpec {
                program: program.to_string(),
                args: vec![],
            }],
            stdout: Redirect::append("/dev/null"),
            stderr: Redirect::append("/dev/null"),
        })
    }

    fn programs(host: &ScriptedHost) -> Vec<String> {
        host.calls().into_iter().map(|c| c.commands[0].program.clone()).collect()
    }

    #[tokio::test]
    async fn test_top_level_halts_on_failure() {
        let host = ScriptedHost::default().fail_when("bad");
        let plan = ExecutablePlan {
            steps: vec![run("one"), run("bad"), run("three")],
        };
        let outcome = execute(&host, &plan, None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, Some(1));
        assert_eq!(programs(&host), vec!["one", "bad"]);
    }

    #[tokio::test]
    async fn test_group_continues_after_failure() {
        let host = ScriptedHost::default().fail_when("bad").fail_to_start("absent");
        let plan = ExecutablePlan {
            steps: vec![
                PlanStep::Group(vec![run("bad"), run("absent"), run("three")]),
                run("after"),
            ],
        };
        let outcome = execute(&host, &plan, None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(programs(&host), vec!["bad", "three"]);
    }

    #[tokio::test]
    async fn test_start_failure_at_top_level_is_error() {
        let host = ScriptedHost::default().fail_to_start("absent");
        let plan = ExecutablePlan {
            steps: vec![run("absent")],
        };
        let err = execute(&host, &plan, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InvocationError::Spawn { .. }), "got: {err:?}");
    }

    #[tokio::test]
    async fn test_cancel_terminates_running_pipeline() {
        let host = ScriptedHost::default().with_delay(Duration::from_secs(30));
        let plan = ExecutablePlan {
            steps: vec![run("slow"), run("never")],
        };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            execute(&host, &plan, None, &cancel),
        )
        .await
        .expect("cancellation should stop the plan promptly")
        .unwrap();
        assert!(outcome.cancelled);
        assert!(!outcome.success);
        assert_eq!(programs(&host), vec!["slow"]);
    }

    #[tokio::test]
    async fn test_timeout_reported_as_failure() {
        let host = ScriptedHost::default().with_delay(Duration::from_secs(30));
        let plan = ExecutablePlan {
            steps: vec![run("slow")],
        };
        let outcome = execute(
            &host,
            &plan,
            Some(Duration::from_millis(20)),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(outcome.timed_out);
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn test_empty_plan_succeeds() {
        let host = ScriptedHost::default();
        let outcome = execute(&host, &ExecutablePlan::default(), None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.success);
        assert!(host.calls().is_empty());
    }
}
