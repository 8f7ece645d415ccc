//! Grid Engine execution context.
//!
//! A pipeline becomes a bash script written next to its stderr log and is
//! submitted with `qsub`. The script records its exit status in a sibling
//! `.rc` file. The monitor polls `qstat -j` until the job leaves the queue
//! and then reads that file; stopping or timing out deletes the job with
//! `qdel`.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Output};
use std::sync::Arc;
use std::time::Duration;

use geneflow_core::command::{
    EnvironmentProbe, InvocationError, InvocationOutcome, Pipeline, ProcessHandle, ProcessHost,
    ProcessSpec, Redirect, shell_quote,
};
use geneflow_types::config::GridEngineConfig;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::host::deadline;
use super::probe::SystemProbe;

/// Consecutive `qstat` failures tolerated before a job is treated as gone.
const MAX_POLL_ERRORS: u32 = 3;

#[derive(Debug, Error)]
enum SchedulerError {
    #[error("failed to run '{program}': {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("qsub printed no job id")]
    NoJobId,
}

/// Submits pipelines to a Grid Engine cluster. The cluster must share the
/// engine's filesystem: scripts, logs and outputs are plain local paths.
#[derive(Debug, Clone)]
pub struct GridEngineHost {
    config: Arc<GridEngineConfig>,
}

impl GridEngineHost {
    pub fn new(config: GridEngineConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    fn program(&self, name: &str) -> String {
        match &self.config.bin_dir {
            Some(dir) => Path::new(dir).join(name).display().to_string(),
            None => name.to_string(),
        }
    }

    fn submit_args(&self, job_name: &str, script: &Path) -> Vec<String> {
        let mut args: Vec<String> = ["-terse", "-N", job_name, "-o", "/dev/null", "-e", "/dev/null"]
            .iter()
            .map(|a| a.to_string())
            .collect();
        if let Some(queue) = &self.config.queue {
            args.push("-q".to_string());
            args.push(queue.clone());
        }
        if let Some(slots) = self.config.slots {
            args.extend(["-pe".to_string(), "smp".to_string(), slots.to_string()]);
        }
        if let Some(other) = &self.config.other {
            args.extend(other.split_whitespace().map(str::to_string));
        }
        args.push(script.display().to_string());
        args
    }

    async fn run(&self, name: &str, args: &[String]) -> Result<Output, SchedulerError> {
        let program = self.program(name);
        Command::new(&program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| SchedulerError::Io { program, source })
    }

    async fn submit(&self, job_name: &str, script: &Path) -> Result<String, SchedulerError> {
        let output = self.run("qsub", &self.submit_args(job_name, script)).await?;
        if !output.status.success() {
            return Err(SchedulerError::Failed {
                program: "qsub".to_string(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        parse_job_id(&String::from_utf8_lossy(&output.stdout)).ok_or(SchedulerError::NoJobId)
    }

    /// Resolves once `qstat -j` no longer knows the job.
    async fn wait_gone(&self, job_id: &str) {
        let poll = Duration::from_millis(self.config.poll_ms.max(10));
        let args = ["-j".to_string(), job_id.to_string()];
        let mut errors = 0;
        loop {
            match self.run("qstat", &args).await {
                Ok(output) if output.status.success() => errors = 0,
                Ok(_) => return,
                Err(e) => {
                    errors += 1;
                    tracing::warn!(job_id = %job_id, error = %e, "qstat failed");
                    if errors >= MAX_POLL_ERRORS {
                        return;
                    }
                }
            }
            tokio::time::sleep(poll).await;
        }
    }

    async fn delete(&self, job_id: &str) {
        match self.run("qdel", &[job_id.to_string()]).await {
            Ok(output) if output.status.success() => {
                tracing::debug!(job_id = %job_id, "grid engine job deleted");
            }
            Ok(output) => tracing::warn!(
                job_id = %job_id,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "qdel failed"
            ),
            Err(e) => tracing::warn!(job_id = %job_id, error = %e, "qdel failed"),
        }
    }
}

/// Files of one submission, named after the pipeline's stderr log.
#[derive(Debug)]
struct JobFiles {
    name: String,
    script: PathBuf,
    exit_code: PathBuf,
    exit_code_tmp: PathBuf,
}

impl JobFiles {
    fn for_pipeline(pipeline: &Pipeline) -> Self {
        let log = &pipeline.stderr.path;
        let name = log
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "geneflow".to_string());
        Self {
            name,
            script: log.with_extension("sh"),
            exit_code: log.with_extension("rc"),
            exit_code_tmp: log.with_extension("rc.tmp"),
        }
    }
}

fn quote_path(path: &Path) -> String {
    shell_quote(&path.display().to_string())
}

fn render_command(spec: &ProcessSpec) -> String {
    std::iter::once(spec.program.as_str())
        .chain(spec.args.iter().map(String::as_str))
        .map(shell_quote)
        .collect::<Vec<_>>()
        .join(" ")
}

fn render_redirect(fd: &str, redirect: &Redirect) -> String {
    let op = if redirect.append { ">>" } else { ">" };
    format!("{fd}{op} {}", quote_path(&redirect.path))
}

/// The job script: the pipeline under `pipefail` with its redirects, then
/// its exit status written atomically to the `.rc` file.
fn render_script(pipeline: &Pipeline, files: &JobFiles) -> String {
    let commands = pipeline
        .commands
        .iter()
        .map(render_command)
        .collect::<Vec<_>>()
        .join(" | ");
    format!(
        "#!/bin/bash\nset -o pipefail\n{{ {commands}; }} {} {} < /dev/null\necho $? > {} && mv {} {}\n",
        render_redirect("", &pipeline.stdout),
        render_redirect("2", &pipeline.stderr),
        quote_path(&files.exit_code_tmp),
        quote_path(&files.exit_code_tmp),
        quote_path(&files.exit_code),
    )
}

/// The job id from `qsub -terse` output. Array jobs print `<id>.<range>`.
fn parse_job_id(stdout: &str) -> Option<String> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    let id = line.split('.').next().unwrap_or(line);
    (!id.is_empty()).then(|| id.to_string())
}

async fn read_exit_code(path: &Path) -> InvocationOutcome {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => match text.trim().parse::<i32>() {
            Ok(code) => InvocationOutcome::exited(code),
            Err(_) => {
                tracing::warn!(path = %path.display(), content = %text.trim(), "unreadable exit status");
                InvocationOutcome::default()
            }
        },
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "job ended without recording an exit status");
            InvocationOutcome::default()
        }
    }
}

/// Why the monitor stopped polling.
enum Stop {
    Gone,
    Cancelled,
    TimedOut,
}

async fn monitor(
    host: GridEngineHost,
    files: JobFiles,
    stop: CancellationToken,
    timeout: Option<Duration>,
) -> InvocationOutcome {
    let job_id = match host.submit(&files.name, &files.script).await {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!(script = %files.script.display(), error = %e, "grid engine submission failed");
            return InvocationOutcome::default();
        }
    };
    tracing::info!(job_id = %job_id, script = %files.script.display(), "grid engine job submitted");

    let reason = tokio::select! {
        () = host.wait_gone(&job_id) => Stop::Gone,
        () = stop.cancelled() => Stop::Cancelled,
        () = deadline(timeout) => Stop::TimedOut,
    };

    match reason {
        Stop::Gone => read_exit_code(&files.exit_code).await,
        Stop::Cancelled => {
            host.delete(&job_id).await;
            InvocationOutcome::cancelled()
        }
        Stop::TimedOut => {
            tracing::warn!(job_id = %job_id, timeout_secs = ?timeout.map(|t| t.as_secs()), "grid engine job timed out");
            host.delete(&job_id).await;
            InvocationOutcome::timed_out()
        }
    }
}

impl ProcessHost for GridEngineHost {
    fn spawn(
        &self,
        pipeline: &Pipeline,
        timeout: Option<Duration>,
    ) -> Result<ProcessHandle, InvocationError> {
        if pipeline.commands.is_empty() {
            return Err(InvocationError::EmptyPipeline);
        }
        let qsub = self.program("qsub");
        if !SystemProbe.in_path(&qsub) {
            return Err(InvocationError::Spawn {
                program: qsub,
                reason: "not found".to_string(),
            });
        }

        let files = JobFiles::for_pipeline(pipeline);
        let script_error = |e: std::io::Error| InvocationError::Script {
            path: files.script.display().to_string(),
            reason: e.to_string(),
        };
        match std::fs::remove_file(&files.exit_code) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(script_error(e)),
        }
        std::fs::write(&files.script, render_script(pipeline, &files)).map_err(script_error)?;

        let stop = CancellationToken::new();
        let task = tokio::spawn(monitor(self.clone(), files, stop.clone(), timeout));
        Ok(ProcessHandle::new(None, stop, task))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    // A single-host stand-in for the cluster: jobs run in the background
    // and are known to `qstat` until they write their exit status.
    const QSUB: &str = r#"#!/bin/sh
dir=$(dirname "$0")
for last; do :; done
echo "$@" > "$dir/qsub.args"
bash "$last" > /dev/null 2>&1 &
echo "$last" > "$dir/job.$!"
echo "$!"
"#;

    const QSTAT: &str = r#"#!/bin/sh
dir=$(dirname "$0")
[ -f "$dir/job.$2" ] || exit 1
script=$(cat "$dir/job.$2")
[ -f "${script%.sh}.rc" ] && exit 1
exit 0
"#;

    const QDEL: &str = r#"#!/bin/sh
dir=$(dirname "$0")
kill "$1" 2> /dev/null
rm -f "$dir/job.$1"
echo "$1" >> "$dir/qdel.log"
"#;

    struct Cluster {
        dir: tempfile::TempDir,
        host: GridEngineHost,
    }

    impl Cluster {
        fn bin(&self) -> PathBuf {
            self.dir.path().join("bin")
        }

        fn read(&self, name: &str) -> String {
            std::fs::read_to_string(self.dir.path().join(name)).unwrap()
        }

        fn pipeline(&self, commands: Vec<ProcessSpec>) -> Pipeline {
            Pipeline {
                commands,
                stdout: Redirect::truncate(self.dir.path().join("out.log")),
                stderr: Redirect::truncate(self.dir.path().join("gf-1-align-s1.err")),
            }
        }
    }

    fn cluster() -> Cluster {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        std::fs::create_dir(&bin).unwrap();
        for (name, body) in [("qsub", QSUB), ("qstat", QSTAT), ("qdel", QDEL)] {
            let path = bin.join(name);
            std::fs::write(&path, body).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let host = GridEngineHost::new(GridEngineConfig {
            queue: Some("short.q".into()),
            slots: Some(4),
            other: Some("-V  -cwd".into()),
            bin_dir: Some(bin.display().to_string()),
            poll_ms: 20,
        });
        Cluster { dir, host }
    }

    fn spec(program: &str, args: &[&str]) -> ProcessSpec {
        ProcessSpec {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    async fn invoke(cluster: &Cluster, pipeline: &Pipeline) -> InvocationOutcome {
        tokio::time::timeout(Duration::from_secs(20), cluster.host.invoke(pipeline, None))
            .await
            .expect("job should finish")
            .unwrap()
    }

    #[tokio::test]
    async fn test_job_is_submitted_and_finishes() {
        let cluster = cluster();
        let p = cluster.pipeline(vec![ProcessSpec::shell("echo 'a b'"), spec("tr", &["a-z", "A-Z"])]);

        let outcome = invoke(&cluster, &p).await;
        assert!(outcome.success, "got: {outcome:?}");
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(cluster.read("out.log"), "A B\n");
        assert_eq!(cluster.read("gf-1-align-s1.rc"), "0\n");

        let script = cluster.dir.path().join("gf-1-align-s1.sh");
        let args = std::fs::read_to_string(cluster.bin().join("qsub.args")).unwrap();
        assert_eq!(
            args.trim_end(),
            format!(
                "-terse -N gf-1-align-s1 -o /dev/null -e /dev/null -q short.q -pe smp 4 -V -cwd {}",
                script.display()
            )
        );
    }

    #[tokio::test]
    async fn test_exit_status_is_reported() {
        let cluster = cluster();
        let p = cluster.pipeline(vec![ProcessSpec::shell("echo oops >&2; exit 3")]);
        let outcome = invoke(&cluster, &p).await;
        assert_eq!(outcome.exit_code, Some(3));
        assert!(!outcome.success);
        assert_eq!(cluster.read("gf-1-align-s1.err"), "oops\n");

        let p = cluster.pipeline(vec![spec("false", &[]), spec("cat", &[])]);
        let outcome = invoke(&cluster, &p).await;
        assert_eq!(outcome.exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_terminate_deletes_job() {
        let cluster = cluster();
        let p = cluster.pipeline(vec![spec("sleep", &["5"])]);
        let handle = cluster.host.spawn(&p, None).unwrap();
        handle.terminate();
        let outcome = tokio::time::timeout(Duration::from_secs(10), handle.wait())
            .await
            .unwrap();
        assert!(outcome.cancelled, "got: {outcome:?}");
        let deleted = std::fs::read_to_string(cluster.bin().join("qdel.log")).unwrap();
        assert!(!deleted.trim().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_deletes_job() {
        let cluster = cluster();
        let p = cluster.pipeline(vec![spec("sleep", &["5"])]);
        let outcome = cluster
            .host
            .invoke(&p, Some(Duration::from_millis(200)))
            .await
            .unwrap();
        assert!(outcome.timed_out, "got: {outcome:?}");
        assert!(cluster.bin().join("qdel.log").exists());
    }

    #[test]
    fn test_missing_qsub_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let host = GridEngineHost::new(GridEngineConfig {
            bin_dir: Some(dir.path().display().to_string()),
            ..Default::default()
        });
        let p = Pipeline {
            commands: vec![spec("true", &[])],
            stdout: Redirect::append(dir.path().join("out.log")),
            stderr: Redirect::append(dir.path().join("err.log")),
        };
        let err = host.spawn(&p, None).unwrap_err();
        assert!(matches!(err, InvocationError::Spawn { ref program, .. } if program.ends_with("/qsub")), "got: {err:?}");
    }

    #[test]
    fn test_render_script() {
        let p = Pipeline {
            commands: vec![
                ProcessSpec::shell("zcat /data/s 1.fq"),
                spec("wc", &["-l"]),
            ],
            stdout: Redirect::truncate("/work/my dir/count.txt"),
            stderr: Redirect::append("/work/_log/gf-1-count-x.err"),
        };
        let files = JobFiles::for_pipeline(&p);
        assert_eq!(files.name, "gf-1-count-x");
        assert_eq!(files.script, PathBuf::from("/work/_log/gf-1-count-x.sh"));
        assert_eq!(
            render_script(&p, &files),
            "#!/bin/bash\n\
             set -o pipefail\n\
             { sh -c 'zcat /data/s 1.fq' | wc -l; } > '/work/my dir/count.txt' 2>> /work/_log/gf-1-count-x.err < /dev/null\n\
             echo $? > /work/_log/gf-1-count-x.rc.tmp && mv /work/_log/gf-1-count-x.rc.tmp /work/_log/gf-1-count-x.rc\n"
        );
    }

    #[test]
    fn test_parse_job_id() {
        assert_eq!(parse_job_id("4242\n").as_deref(), Some("4242"));
        assert_eq!(parse_job_id("\n4243.1-10:1\n").as_deref(), Some("4243"));
        assert_eq!(parse_job_id("  \n"), None);
    }
}
