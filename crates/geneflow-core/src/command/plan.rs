//! Turning command blocks into executable plans.
//!
//! Conditions are evaluated and variables substituted at build time, so a
//! plan contains only concrete command lines and redirect targets. Shell
//! commands become `sh -c` scripts with their `args` quoted onto `run`.
//! Container commands are argv vectors: `run` is split on whitespace into
//! the program and its leading arguments, behind the runtime's wrapper.

use std::path::{Path, PathBuf};

use geneflow_types::command::{CommandArg, CommandBlock, CommandKind, Runtime, SimpleCommand};
use geneflow_types::error::ResolutionError;

use super::predicate::{EnvironmentProbe, Vars, evaluate_all, substitute};

/// A redirect target for a pipeline's stdout or stderr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub path: PathBuf,
    /// Append rather than truncate.
    pub append: bool,
}

impl Redirect {
    pub fn truncate(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            append: false,
        }
    }

    pub fn append(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            append: true,
        }
    }
}

/// Interpreter for shell-runtime commands.
pub const SHELL: &str = "sh";

/// One process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl ProcessSpec {
    /// `sh -c <script>`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self {
            program: SHELL.to_string(),
            args: vec!["-c".to_string(), script.into()],
        }
    }

    /// The script of an `sh -c` invocation.
    pub fn script(&self) -> Option<&str> {
        match self.args.as_slice() {
            [flag, script] if self.program == SHELL && flag == "-c" => Some(script),
            _ => None,
        }
    }

    /// The command line, for logs and error messages. Shell invocations
    /// show their script.
    pub fn display(&self) -> String {
        if let Some(script) = self.script() {
            return script.to_string();
        }
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Commands chained stdout-to-stdin. Redirects apply to the last command's
/// stdout and to every command's stderr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    pub commands: Vec<ProcessSpec>,
    pub stdout: Redirect,
    pub stderr: Redirect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanStep {
    Run(Pipeline),
    /// Independent steps: all run even if one fails; the group succeeds
    /// only if every member does.
    Group(Vec<PlanStep>),
}

/// Top-level steps run in order and stop at the first failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutablePlan {
    pub steps: Vec<PlanStep>,
}

impl ExecutablePlan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Every pipeline in the plan, depth first.
    pub fn pipelines(&self) -> Vec<&Pipeline> {
        fn walk<'a>(steps: &'a [PlanStep], out: &mut Vec<&'a Pipeline>) {
            for step in steps {
                match step {
                    PlanStep::Run(p) => out.push(p),
                    PlanStep::Group(children) => walk(children, out),
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.steps, &mut out);
        out
    }
}

/// Default stdout/stderr destinations for commands without explicit
/// redirects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogTargets {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

// ---------------------------------------------------------------------------
// Build
// ---------------------------------------------------------------------------

struct Builder<'a> {
    vars: &'a Vars,
    probe: &'a dyn EnvironmentProbe,
    logs: &'a LogTargets,
}

/// Build a plan from a list of command blocks.
pub fn build(
    blocks: &[CommandBlock],
    vars: &Vars,
    probe: &dyn EnvironmentProbe,
    logs: &LogTargets,
) -> Result<ExecutablePlan, ResolutionError> {
    let builder = Builder { vars, probe, logs };
    Ok(ExecutablePlan {
        steps: builder.blocks(blocks)?,
    })
}

impl Builder<'_> {
    fn blocks(&self, blocks: &[CommandBlock]) -> Result<Vec<PlanStep>, ResolutionError> {
        let mut steps = Vec::new();
        for block in blocks {
            steps.extend(self.block(block)?);
        }
        Ok(steps)
    }

    /// A block contributes zero or more steps: its `else` branch may hold
    /// several, and a failed condition without `else` contributes none.
    fn block(&self, block: &CommandBlock) -> Result<Vec<PlanStep>, ResolutionError> {
        if let Some(cond) = &block.condition {
            if !evaluate_all(&cond.test, self.vars, self.probe) {
                return self.blocks(&cond.otherwise);
            }
        }

        match &block.kind {
            CommandKind::Simple(cmd) => Ok(vec![PlanStep::Run(Pipeline {
                commands: vec![self.process(cmd)?],
                stdout: self.redirect(cmd.stdout.as_deref(), &self.logs.stdout)?,
                stderr: self.redirect(cmd.stderr.as_deref(), &self.logs.stderr)?,
            })]),
            CommandKind::Pipe(items) => Ok(self.pipe(items)?.into_iter().collect()),
            CommandKind::Multi(items) => Ok(vec![PlanStep::Group(self.blocks(items)?)]),
        }
    }

    fn pipe(&self, items: &[CommandBlock]) -> Result<Option<PlanStep>, ResolutionError> {
        let mut simple = Vec::new();
        for item in items {
            let skipped = item
                .condition
                .as_ref()
                .is_some_and(|cond| !evaluate_all(&cond.test, self.vars, self.probe));
            if skipped {
                continue;
            }
            match &item.kind {
                CommandKind::Simple(cmd) => simple.push(cmd),
                other => {
                    tracing::warn!(kind = ?kind_name(other), "ignoring non-simple item inside pipe");
                }
            }
        }

        let Some(last) = simple.last() else {
            return Ok(None);
        };
        let commands = simple
            .iter()
            .map(|cmd| self.process(cmd))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(PlanStep::Run(Pipeline {
            commands,
            stdout: self.redirect(last.stdout.as_deref(), &self.logs.stdout)?,
            stderr: self.redirect(last.stderr.as_deref(), &self.logs.stderr)?,
        })))
    }

    fn redirect(&self, explicit: Option<&str>, default: &Path) -> Result<Redirect, ResolutionError> {
        match explicit {
            Some(target) => Ok(Redirect::truncate(substitute(target, self.vars)?)),
            None => Ok(Redirect::append(default)),
        }
    }

    fn process(&self, cmd: &SimpleCommand) -> Result<ProcessSpec, ResolutionError> {
        let run = substitute(&cmd.run, self.vars)?;

        let mut binds = Vec::new();
        let mut args = Vec::new();
        for arg in &cmd.args {
            match arg {
                CommandArg::Literal(text) => args.push(substitute(text, self.vars)?),
                CommandArg::Option { flag, value, mount } => {
                    if let Some(flag) = flag {
                        args.push(substitute(flag, self.vars)?);
                    }
                    if let Some(value) = value {
                        args.push(substitute(value, self.vars)?);
                    }
                    if let Some(mount) = mount {
                        let host = substitute(mount, self.vars)?;
                        if cmd.runtime.is_container() {
                            let (bind, inner) = container_mount(&host, binds.len() + 1);
                            binds.push(bind);
                            args.push(inner);
                        } else {
                            args.push(host);
                        }
                    }
                }
            }
        }

        let (wrapper, mut all, bind_flag) = match cmd.runtime {
            Runtime::Shell => {
                let mut script = run.trim().to_string();
                for arg in &args {
                    script.push(' ');
                    script.push_str(&shell_quote(arg));
                }
                return Ok(ProcessSpec::shell(script));
            }
            Runtime::Singularity => (
                "singularity",
                vec!["-s".to_string(), "exec".to_string()],
                "-B",
            ),
            Runtime::Docker => ("docker", vec!["run".to_string(), "--rm".to_string()], "-v"),
        };
        for bind in binds {
            all.push(bind_flag.to_string());
            all.push(bind);
        }
        all.push(cmd.image.clone().unwrap_or_default());
        all.extend(run.split_whitespace().map(str::to_string));
        all.extend(args);
        Ok(ProcessSpec {
            program: wrapper.to_string(),
            args: all,
        })
    }
}

/// Quote `word` for a POSIX shell. Words made only of safe characters are
/// returned bare; anything else is single-quoted.
pub fn shell_quote(word: &str) -> String {
    if word.is_empty() {
        return "''".to_string();
    }
    let safe = word.chars().all(|c| {
        c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '=' | '@' | '%' | '+' | ',')
    });
    if safe {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', "'\\''"))
}

/// Bind the parent directory of `host_path` at `/data<k>` and return the
/// bind spec plus the in-container path.
fn container_mount(host_path: &str, k: usize) -> (String, String) {
    let path = Path::new(host_path);
    let parent = path
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| ".".to_string());
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mount_point = format!("/data{k}");
    let inner = if name.is_empty() {
        mount_point.clone()
    } else {
        format!("{mount_point}/{name}")
    };
    (format!("{parent}:{mount_point}"), inner)
}

fn kind_name(kind: &CommandKind) -> &'static str {
    match kind {
        CommandKind::Simple(_) => "simple",
        CommandKind::Pipe(_) => "pipe",
        CommandKind::Multi(_) => "multi",
    }
}
