//! Step worker: expands a step into map items and runs each item's
//! commands on the shared invocation pool.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use geneflow_types::command::CommandBlock;
use geneflow_types::definition::{
    AppDefinition, DEFAULT_CONTEXT, StepDefinition, value_to_string,
};
use geneflow_types::error::{LocatorError, ResolutionError};
use geneflow_types::job::{MapItemRecord, StepStatus};
use geneflow_types::slug::slugify;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::command::{
    CommandError, EnvironmentProbe, InvocationError, LogTargets, ProcessHost, Vars, build,
    execute, select,
};
use crate::data::StagingError;
use crate::locator::Locator;
use crate::template::{
    ResolutionContext, WorkflowValues, check_output_overlap, expand_map, resolve_template,
};

use super::Runtime;
use super::status::StatusError;

/// Bytes of an item's stderr log attached to an invocation failure.
const STDERR_TAIL_BYTES: usize = 2048;

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Anything that makes a step FAILED.
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Location(#[from] LocatorError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Invocation(#[from] InvocationError),

    #[error("item '{item}' failed: {reason}")]
    InvocationFailure {
        item: String,
        reason: String,
        exit_code: Option<i32>,
        stderr_tail: String,
    },

    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error(transparent)]
    Status(#[from] StatusError),

    #[error("no host registered for execution context '{0}'")]
    UnknownContext(String),

    #[error("cancelled")]
    Cancelled,

    #[error("step task panicked: {0}")]
    Panicked(String),
}

impl StepError {
    /// The message stored on the step row: the error plus, for failed
    /// invocations, the tail of the item's stderr.
    pub fn detail(&self) -> String {
        match self {
            Self::InvocationFailure { stderr_tail, .. } if !stderr_tail.is_empty() => {
                format!("{self}\n{stderr_tail}")
            }
            _ => self.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Step task
// ---------------------------------------------------------------------------

/// Everything one step needs, owned so it can move into a spawned task.
pub(crate) struct StepTask {
    pub job_id: Uuid,
    pub name: String,
    pub step: StepDefinition,
    pub app: Arc<AppDefinition>,
    /// Requested exec method, `auto` or a method name.
    pub method: String,
    /// Execution context the step's items run in.
    pub context: String,
    pub values: Arc<WorkflowValues>,
    /// Output locations of the step's (completed) dependencies.
    pub dependencies: BTreeMap<String, Locator>,
    /// Job work directory.
    pub work: Locator,
    pub cancel: CancellationToken,
}

/// Per-step state shared by its item tasks.
struct ItemScope {
    job_id: Uuid,
    name: String,
    app: Arc<AppDefinition>,
    method: String,
    /// Host of a non-local context; `None` runs on the engine's own host.
    host: Option<Arc<dyn ProcessHost>>,
    step_dir: Locator,
    log_dir: PathBuf,
    cancel: CancellationToken,
    timeout: Option<Duration>,
    max_retries: u32,
}

/// Progress of one item, folded into its `MapItemRecord`.
#[derive(Debug, Default)]
struct ItemProgress {
    attempt: u32,
    exec_method: Option<String>,
    exit_code: Option<i32>,
}

/// Run a step to completion and return its output directory.
pub(crate) async fn run_step<H, P>(rt: Arc<Runtime<H, P>>, task: StepTask) -> Result<Locator, StepError>
where
    H: ProcessHost + 'static,
    P: EnvironmentProbe + 'static,
{
    let host = if task.context == DEFAULT_CONTEXT {
        None
    } else {
        let host = rt
            .contexts
            .get(&task.context)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| StepError::UnknownContext(task.context.clone()))?;
        Some(host)
    };

    let step_dir = task.work.join(&slugify(&task.name))?.as_directory();
    let log_dir = step_dir.join("_log")?.as_directory();
    if rt.data.exists(&step_dir).await? {
        tracing::info!(step = %task.name, dir = %step_dir, "clearing previous step output");
        rt.data.delete(&step_dir).await?;
    }
    rt.data.mkdir(&step_dir).await?;
    rt.data.mkdir(&log_dir).await?;

    let base = ResolutionContext::new(Arc::clone(&task.values), task.dependencies.clone());
    let contexts = expand_map(&task.step, &base, &rt.data).await?;

    let mut prepared = Vec::with_capacity(contexts.len());
    for ctx in &contexts {
        prepared.push((ctx.filename().to_string(), resolve_template(&task.step, ctx)?));
    }
    let outputs: Vec<(String, String)> = prepared
        .iter()
        .map(|(filename, template)| {
            (
                filename.clone(),
                template.get("output").cloned().unwrap_or_default(),
            )
        })
        .collect();
    check_output_overlap(&outputs)?;

    let mut records: Vec<MapItemRecord> = prepared
        .iter()
        .map(|(filename, template)| MapItemRecord {
            filename: filename.clone(),
            status: StepStatus::Pending,
            attempt: 0,
            template: template.clone(),
            exec_method: None,
            exit_code: None,
            error: None,
        })
        .collect();
    rt.status
        .update_items(task.job_id, &task.name, records.clone())
        .await?;

    tracing::info!(
        job_id = %task.job_id,
        step = %task.name,
        items = records.len(),
        context = %task.context,
        output = %step_dir,
        "running step"
    );

    let scope = Arc::new(ItemScope {
        job_id: task.job_id,
        name: task.name.clone(),
        app: Arc::clone(&task.app),
        method: task.method.clone(),
        host,
        log_dir: PathBuf::from(log_dir.chopped_path()),
        step_dir: step_dir.clone(),
        cancel: task.cancel.clone(),
        timeout: rt.config.invocation_timeout_secs.map(Duration::from_secs),
        max_retries: rt.config.max_retries,
    });

    let mut join_set = JoinSet::new();
    for (index, (filename, template)) in prepared.into_iter().enumerate() {
        let rt = Arc::clone(&rt);
        let scope = Arc::clone(&scope);
        join_set.spawn(async move {
            let mut progress = ItemProgress::default();
            let result = tokio::select! {
                permit = Arc::clone(&rt.workers).acquire_owned() => match permit {
                    Ok(_permit) => run_item(&rt, &scope, &filename, &template, &mut progress).await,
                    Err(_) => Err(StepError::Cancelled),
                },
                _ = scope.cancel.cancelled() => Err(StepError::Cancelled),
            };
            (index, progress, result)
        });
    }

    let mut first_error: Option<(usize, StepError)> = None;
    while let Some(joined) = join_set.join_next().await {
        let (index, progress, result) = joined.map_err(|e| StepError::Panicked(e.to_string()))?;
        let record = &mut records[index];
        record.attempt = progress.attempt;
        record.exec_method = progress.exec_method;
        record.exit_code = progress.exit_code;
        match result {
            Ok(()) => record.status = StepStatus::Completed,
            Err(e) => {
                record.status = StepStatus::Failed;
                record.error = Some(e.detail());
                // Report the failure of the earliest item, in listing order.
                if first_error.as_ref().is_none_or(|(i, _)| index < *i) {
                    first_error = Some((index, e));
                }
            }
        }
        rt.status
            .update_items(task.job_id, &task.name, records.clone())
            .await?;
    }

    match first_error {
        Some((_, e)) => Err(e),
        None => Ok(step_dir),
    }
}

// ---------------------------------------------------------------------------
// Items
// ---------------------------------------------------------------------------

async fn run_item<H, P>(
    rt: &Runtime<H, P>,
    scope: &ItemScope,
    filename: &str,
    template: &BTreeMap<String, String>,
    progress: &mut ItemProgress,
) -> Result<(), StepError>
where
    H: ProcessHost,
    P: EnvironmentProbe,
{
    let vars = item_vars(&scope.app, template, &scope.step_dir)?;
    let method = select(&scope.app.exec_methods, &scope.method, &vars, &*rt.probe)?;
    progress.exec_method = Some(method.name.clone());

    let blocks = command_blocks(&scope.app, &method.exec, &vars);
    let output_slug = slugify(template.get("output").map_or("", String::as_str));

    let mut attempt = 0;
    loop {
        attempt += 1;
        progress.attempt = attempt;
        let log_name = format!("gf-{attempt}-{}-{output_slug}", slugify(&scope.name));
        let logs = LogTargets {
            stdout: scope.log_dir.join(format!("{log_name}.out")),
            stderr: scope.log_dir.join(format!("{log_name}.err")),
        };
        let plan = build(&blocks, &vars, &*rt.probe, &logs)?;

        tracing::debug!(
            job_id = %scope.job_id,
            step = %scope.name,
            item = filename,
            method = %method.name,
            attempt,
            pipelines = plan.pipelines().len(),
            "running item"
        );

        let executed = match &scope.host {
            Some(host) => execute(&**host, &plan, scope.timeout, &scope.cancel).await,
            None => execute(&*rt.host, &plan, scope.timeout, &scope.cancel).await,
        };
        let failure = match executed {
            Ok(outcome) if outcome.success => {
                progress.exit_code = outcome.exit_code;
                return Ok(());
            }
            Ok(outcome) if outcome.cancelled => return Err(StepError::Cancelled),
            Ok(outcome) => {
                progress.exit_code = outcome.exit_code;
                StepError::InvocationFailure {
                    item: filename.to_string(),
                    reason: outcome.describe(),
                    exit_code: outcome.exit_code,
                    stderr_tail: read_tail(&logs.stderr).await,
                }
            }
            Err(e) => StepError::Invocation(e),
        };

        if attempt > scope.max_retries {
            return Err(failure);
        }
        tracing::warn!(
            job_id = %scope.job_id,
            step = %scope.name,
            item = filename,
            attempt,
            error = %failure,
            "item failed, retrying"
        );
    }
}

/// Variables visible to an item's commands: app inputs as local paths,
/// parameters and any other template entries as literals, and `output` as
/// the item's output path. Only values that are defined are present.
fn item_vars(
    app: &AppDefinition,
    template: &BTreeMap<String, String>,
    step_dir: &Locator,
) -> Result<Vars, StepError> {
    let mut vars = Vars::new();

    for (name, input) in &app.inputs {
        let raw = template
            .get(name)
            .filter(|v| !v.is_empty())
            .or(input.default.as_ref());
        if let Some(raw) = raw {
            let location = Locator::parse(raw)?;
            vars.insert(name.clone(), location.chopped_path().to_string());
        }
    }

    for (name, param) in &app.parameters {
        match template.get(name).filter(|v| !v.is_empty()) {
            Some(value) => {
                vars.insert(name.clone(), value.clone());
            }
            None => {
                if let Some(default) = param.default.as_ref().filter(|d| !d.is_null()) {
                    vars.insert(name.clone(), value_to_string(default));
                }
            }
        }
    }

    for (key, value) in template {
        if key != "output" && !value.is_empty() {
            vars.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }

    if let Some(output) = template.get("output") {
        let location = step_dir.join(output)?;
        vars.insert("output".to_string(), location.chopped_path().to_string());
    }
    Ok(vars)
}

/// `pre_exec`, the method's blocks, `post_exec`, then the post-exec blocks
/// of each input and parameter that has a value.
fn command_blocks(app: &AppDefinition, exec: &[CommandBlock], vars: &Vars) -> Vec<CommandBlock> {
    let mut blocks: Vec<CommandBlock> = app
        .pre_exec
        .iter()
        .chain(exec)
        .chain(&app.post_exec)
        .cloned()
        .collect();
    for (name, input) in &app.inputs {
        if vars.contains_key(name) {
            blocks.extend(input.post_exec.iter().cloned());
        }
    }
    for (name, param) in &app.parameters {
        if vars.contains_key(name) {
            blocks.extend(param.post_exec.iter().cloned());
        }
    }
    blocks
}

async fn read_tail(path: &Path) -> String {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let start = bytes.len().saturating_sub(STDERR_TAIL_BYTES);
            String::from_utf8_lossy(&bytes[start..]).trim_end().to_string()
        }
        Err(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(yaml: &str) -> AppDefinition {
        serde_yaml_ng::from_str(yaml).unwrap()
    }

    const APP: &str = r#"
name: bwa-mem
inputs:
  reads: {type: File}
  index: {type: Directory, default: /refs/hg38}
  mates: {type: File}
parameters:
  threads: {type: int, default: 1}
  preset: {type: string}
pre_exec:
  - run: mkdir
    args: ['-p', '${output}']
exec_methods:
  - name: environment
    exec:
      - run: bwa mem
post_exec:
  - run: touch
    args: ['${output}.done']
"#;

    #[test]
    fn test_item_vars_maps_inputs_params_and_output() {
        let app = app(APP);
        let template = BTreeMap::from([
            ("reads".to_string(), "local:/data/s1_R1.fastq".to_string()),
            ("threads".to_string(), "8".to_string()),
            ("mates".to_string(), String::new()),
            ("sample".to_string(), "s1".to_string()),
            ("output".to_string(), "s1.sam".to_string()),
        ]);
        let step_dir = Locator::parse("/work/job/align/").unwrap();
        let vars = item_vars(&app, &template, &step_dir).unwrap();

        assert_eq!(vars["reads"], "/data/s1_R1.fastq");
        assert_eq!(vars["index"], "/refs/hg38");
        assert_eq!(vars["threads"], "8");
        assert_eq!(vars["sample"], "s1");
        assert_eq!(vars["output"], "/work/job/align/s1.sam");
        assert!(!vars.contains_key("mates"));
        assert!(!vars.contains_key("preset"));
    }

    #[test]
    fn test_item_vars_rejects_malformed_input() {
        let app = app(APP);
        let template = BTreeMap::from([
            ("reads".to_string(), "ftp://host/reads".to_string()),
            ("output".to_string(), "x".to_string()),
        ]);
        let step_dir = Locator::parse("/work/").unwrap();
        let err = item_vars(&app, &template, &step_dir).unwrap_err();
        assert!(matches!(err, StepError::Location(_)), "got: {err:?}");
    }

    #[test]
    fn test_command_blocks_order() {
        let app = app(APP);
        let vars = Vars::from([("output".to_string(), "/o".to_string())]);
        let blocks = command_blocks(&app, &app.exec_methods[0].exec, &vars);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0], app.pre_exec[0]);
        assert_eq!(blocks[2], app.post_exec[0]);
    }

    #[tokio::test]
    async fn test_read_tail_keeps_last_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.err");
        let mut body = "a".repeat(STDERR_TAIL_BYTES);
        body.push_str("last line\n");
        std::fs::write(&path, &body).unwrap();

        let tail = read_tail(&path).await;
        assert_eq!(tail.len(), STDERR_TAIL_BYTES - 1);
        assert!(tail.ends_with("last line"));
        assert_eq!(read_tail(&dir.path().join("missing")).await, "");
    }

    #[test]
    fn test_failure_detail_includes_stderr() {
        let err = StepError::InvocationFailure {
            item: "s1_R1.fastq".into(),
            reason: "exit code 2".into(),
            exit_code: Some(2),
            stderr_tail: "bwa: index not found".into(),
        };
        assert_eq!(
            err.detail(),
            "item 's1_R1.fastq' failed: exit code 2\nbwa: index not found"
        );
        assert_eq!(StepError::Cancelled.detail(), "cancelled");
    }
}
