//! Pipeline execution on `tokio::process`.
//!
//! Each command of a pipeline is spawned as given (shell commands arrive
//! as `sh -c` invocations) with its stdout piped into the next command's
//! stdin. The last command's stdout
//! and every command's stderr go to the pipeline's redirect files. A
//! monitor task owns the children and resolves the handle.

use std::fs::{File, OpenOptions};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use geneflow_core::command::{
    InvocationError, InvocationOutcome, Pipeline, ProcessHandle, ProcessHost, Redirect,
};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

/// Spawns pipelines as child processes of the engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioProcessHost;

impl TokioProcessHost {
    pub fn new() -> Self {
        Self
    }
}

fn open_redirect(redirect: &Redirect) -> Result<File, InvocationError> {
    let mut options = OpenOptions::new();
    options.create(true);
    if redirect.append {
        options.append(true);
    } else {
        options.write(true).truncate(true);
    }
    options.open(&redirect.path).map_err(|e| InvocationError::Redirect {
        path: redirect.path.display().to_string(),
        reason: e.to_string(),
    })
}

fn clone_redirect(file: &File, redirect: &Redirect) -> Result<File, InvocationError> {
    file.try_clone().map_err(|e| InvocationError::Redirect {
        path: redirect.path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Why the monitor stopped waiting.
enum Stop {
    Exited(std::io::Result<Vec<ExitStatus>>),
    Cancelled,
    TimedOut,
}

async fn wait_all(children: &mut [Child]) -> std::io::Result<Vec<ExitStatus>> {
    let mut statuses = Vec::with_capacity(children.len());
    for child in children.iter_mut() {
        statuses.push(child.wait().await?);
    }
    Ok(statuses)
}

pub(crate) async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

async fn kill_all(children: &mut [Child]) {
    for child in children.iter_mut() {
        if let Err(e) = child.kill().await {
            tracing::debug!(pid = ?child.id(), error = %e, "kill failed");
        }
    }
}

/// Pipefail semantics: the outcome reflects the last command that did not
/// succeed, or success when all did.
fn outcome_of(statuses: &[ExitStatus]) -> InvocationOutcome {
    match statuses.iter().rev().find(|s| !s.success()) {
        None => InvocationOutcome::succeeded(),
        Some(status) => match status.code() {
            Some(code) => InvocationOutcome::exited(code),
            None => InvocationOutcome::default(),
        },
    }
}

async fn monitor(
    mut children: Vec<Child>,
    stop: CancellationToken,
    timeout: Option<Duration>,
) -> InvocationOutcome {
    let reason = tokio::select! {
        result = wait_all(&mut children) => Stop::Exited(result),
        () = stop.cancelled() => Stop::Cancelled,
        () = deadline(timeout) => Stop::TimedOut,
    };

    match reason {
        Stop::Exited(Ok(statuses)) => outcome_of(&statuses),
        Stop::Exited(Err(e)) => {
            tracing::warn!(error = %e, "failed to wait for pipeline");
            kill_all(&mut children).await;
            InvocationOutcome::default()
        }
        Stop::Cancelled => {
            kill_all(&mut children).await;
            InvocationOutcome::cancelled()
        }
        Stop::TimedOut => {
            tracing::warn!(timeout_secs = ?timeout.map(|t| t.as_secs()), "pipeline timed out");
            kill_all(&mut children).await;
            InvocationOutcome::timed_out()
        }
    }
}

impl ProcessHost for TokioProcessHost {
    fn spawn(
        &self,
        pipeline: &Pipeline,
        timeout: Option<Duration>,
    ) -> Result<ProcessHandle, InvocationError> {
        if pipeline.commands.is_empty() {
            return Err(InvocationError::EmptyPipeline);
        }
        let stdout_file = open_redirect(&pipeline.stdout)?;
        let stderr_file = open_redirect(&pipeline.stderr)?;

        let last = pipeline.commands.len() - 1;
        let mut children: Vec<Child> = Vec::with_capacity(pipeline.commands.len());
        let mut previous_stdout: Option<Stdio> = None;

        for (i, spec) in pipeline.commands.iter().enumerate() {
            let mut command = Command::new(&spec.program);
            command
                .args(&spec.args)
                .kill_on_drop(true)
                .stdin(previous_stdout.take().unwrap_or_else(Stdio::null))
                .stderr(clone_redirect(&stderr_file, &pipeline.stderr)?);
            if i == last {
                command.stdout(clone_redirect(&stdout_file, &pipeline.stdout)?);
            } else {
                command.stdout(Stdio::piped());
            }

            // Children spawned so far are killed on drop if this fails.
            let mut child = command.spawn().map_err(|e| InvocationError::Spawn {
                program: spec.program.clone(),
                reason: e.to_string(),
            })?;

            if i != last {
                let piped = child.stdout.take().ok_or_else(|| InvocationError::Spawn {
                    program: spec.program.clone(),
                    reason: "stdout was not captured".to_string(),
                })?;
                let stdio: Stdio = piped.try_into().map_err(|e: std::io::Error| {
                    InvocationError::Spawn {
                        program: spec.program.clone(),
                        reason: e.to_string(),
                    }
                })?;
                previous_stdout = Some(stdio);
            }
            children.push(child);
        }

        let pid = children.last().and_then(Child::id);
        tracing::debug!(
            pid = ?pid,
            commands = pipeline.commands.len(),
            command = %pipeline.commands[0].display(),
            "pipeline started"
        );

        let stop = CancellationToken::new();
        let task = tokio::spawn(monitor(children, stop.clone(), timeout));
        Ok(ProcessHandle::new(pid, stop, task))
    }
}

#[cfg(test)]
mod tests {
    use geneflow_core::command::ProcessSpec;

    use super::*;
    use crate::process::SystemProbe;

    fn spec(program: &str, args: &[&str]) -> ProcessSpec {
        ProcessSpec {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    fn pipeline(dir: &tempfile::TempDir, commands: Vec<ProcessSpec>) -> Pipeline {
        Pipeline {
            commands,
            stdout: Redirect::truncate(dir.path().join("out.log")),
            stderr: Redirect::truncate(dir.path().join("err.log")),
        }
    }

    fn read(dir: &tempfile::TempDir, name: &str) -> String {
        std::fs::read_to_string(dir.path().join(name)).unwrap()
    }

    #[tokio::test]
    async fn test_shell_block_runs_through_shell() {
        use geneflow_core::command::{ExecutablePlan, LogTargets, PlanStep, Vars, build, execute};
        use geneflow_types::command::CommandBlock;

        let dir = tempfile::tempdir().unwrap();
        let out_dir = dir.path().join("my out");
        std::fs::create_dir_all(&out_dir).unwrap();
        let blocks: Vec<CommandBlock> = serde_yaml_ng::from_str(
            r#"
- run: echo 'a  b' > "${output}" && printf '%s|' ${sample}
  args: ["${label}"]
- pipe:
    - run: cat "${output}"
    - run: tr a-z A-Z
      stdout: ${output}.upper
"#,
        )
        .unwrap();
        let vars: Vars = [
            ("output", out_dir.join("s1.txt").display().to_string()),
            ("sample", "x y".to_string()),
            ("label", "lab el".to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        let logs = LogTargets {
            stdout: dir.path().join("out.log"),
            stderr: dir.path().join("err.log"),
        };

        let plan: ExecutablePlan = build(&blocks, &vars, &SystemProbe, &logs).unwrap();
        assert!(matches!(&plan.steps[0], PlanStep::Run(p) if p.commands[0].program == "sh"));
        let outcome = execute(&TokioProcessHost, &plan, None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.success, "got: {outcome:?}, stderr: {}", read(&dir, "err.log"));

        assert_eq!(
            std::fs::read_to_string(out_dir.join("s1.txt")).unwrap(),
            "a  b\n"
        );
        assert_eq!(
            std::fs::read_to_string(out_dir.join("s1.txt.upper")).unwrap(),
            "A  B\n"
        );
        assert_eq!(read(&dir, "out.log"), "x|y|lab el|");
    }

    #[tokio::test]
    async fn test_stdout_goes_to_redirect() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(&dir, vec![spec("echo", &["hello", "world"])]);
        let outcome = TokioProcessHost.invoke(&p, None).await.unwrap();
        assert!(outcome.success, "got: {outcome:?}");
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(read(&dir, "out.log"), "hello world\n");
    }

    #[tokio::test]
    async fn test_commands_are_chained() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(
            &dir,
            vec![spec("echo", &["acgt"]), spec("tr", &["a-z", "A-Z"])],
        );
        let outcome = TokioProcessHost.invoke(&p, None).await.unwrap();
        assert!(outcome.success, "got: {outcome:?}");
        assert_eq!(read(&dir, "out.log"), "ACGT\n");
    }

    #[tokio::test]
    async fn test_append_redirect_keeps_content() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = pipeline(&dir, vec![spec("echo", &["one"])]);
        TokioProcessHost.invoke(&p, None).await.unwrap();
        p.stdout = Redirect::append(dir.path().join("out.log"));
        p.commands = vec![spec("echo", &["two"])];
        TokioProcessHost.invoke(&p, None).await.unwrap();
        assert_eq!(read(&dir, "out.log"), "one\ntwo\n");
    }

    #[tokio::test]
    async fn test_stderr_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(&dir, vec![spec("sh", &["-c", "echo oops >&2; exit 3"])]);
        let outcome = TokioProcessHost.invoke(&p, None).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(read(&dir, "err.log"), "oops\n");
    }

    #[tokio::test]
    async fn test_failure_early_in_pipeline_fails_it() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(&dir, vec![spec("false", &[]), spec("cat", &[])]);
        let outcome = TokioProcessHost.invoke(&p, None).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(&dir, vec![spec("geneflow-no-such-tool", &[])]);
        let err = TokioProcessHost.spawn(&p, None).unwrap_err();
        assert!(matches!(err, InvocationError::Spawn { .. }), "got: {err:?}");
    }

    #[tokio::test]
    async fn test_empty_pipeline_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = TokioProcessHost.spawn(&pipeline(&dir, vec![]), None).unwrap_err();
        assert_eq!(err, InvocationError::EmptyPipeline);
    }

    #[tokio::test]
    async fn test_timeout_kills_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(&dir, vec![spec("sleep", &["10"])]);
        let started = std::time::Instant::now();
        let outcome = TokioProcessHost
            .invoke(&p, Some(Duration::from_millis(100)))
            .await
            .unwrap();
        assert!(outcome.timed_out, "got: {outcome:?}");
        assert!(!outcome.success);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_terminate_cancels_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(&dir, vec![spec("sleep", &["10"])]);
        let handle = TokioProcessHost.spawn(&p, None).unwrap();
        assert!(handle.pid().is_some());
        assert!(handle.is_running());
        handle.terminate();
        let outcome = handle.wait().await;
        assert!(outcome.cancelled, "got: {outcome:?}");
    }
}
