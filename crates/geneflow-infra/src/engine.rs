//! Assembly of an engine over the local host: SQLite job store, local
//! filesystem data backend, tokio process host, and system probe. A
//! `[gridengine]` config section adds the `gridengine` execution context.

use std::path::Path;
use std::sync::Arc;

use geneflow_core::data::DataManager;
use geneflow_core::scheduler::Engine;
use geneflow_types::config::EngineConfig;
use geneflow_types::definition::GRIDENGINE_CONTEXT;
use thiserror::Error;

use crate::config::load_engine_config;
use crate::data::LocalBackend;
use crate::filesystem::database_url;
use crate::process::{GridEngineHost, SystemProbe, TokioProcessHost};
use crate::sqlite::job::SqliteJobRepository;
use crate::sqlite::pool::DatabasePool;

/// The engine the `gf` binary runs.
pub type LocalEngine = Engine<SqliteJobRepository, TokioProcessHost, SystemProbe>;

#[derive(Debug, Error)]
pub enum EngineSetupError {
    #[error("failed to create data directory '{path}': {source}")]
    DataDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open job database: {0}")]
    Database(#[from] sqlx::Error),
}

/// Load `{data_dir}/config.toml` and open an engine over `data_dir`.
pub async fn build_local_engine(data_dir: &Path) -> Result<LocalEngine, EngineSetupError> {
    let config = load_engine_config(data_dir).await;
    open_local_engine(data_dir, config).await
}

/// Open an engine over `data_dir` with an explicit configuration.
pub async fn open_local_engine(
    data_dir: &Path,
    config: EngineConfig,
) -> Result<LocalEngine, EngineSetupError> {
    tokio::fs::create_dir_all(data_dir)
        .await
        .map_err(|source| EngineSetupError::DataDir {
            path: data_dir.display().to_string(),
            source,
        })?;

    let pool = DatabasePool::new(&database_url(data_dir, &config.database)).await?;
    let repo = Arc::new(SqliteJobRepository::new(pool));
    let data = DataManager::new().with_backend(LocalBackend::new());
    let gridengine = config.gridengine.clone();

    let engine = Engine::new(
        repo,
        data,
        TokioProcessHost::new(),
        SystemProbe::new(),
        config,
    );
    if let Some(grid) = gridengine {
        engine.register_context(GRIDENGINE_CONTEXT, GridEngineHost::new(grid));
    }

    tracing::debug!(
        data_dir = %data_dir.display(),
        max_concurrency = engine.config().max_concurrency,
        contexts = ?engine.contexts(),
        "local engine ready"
    );
    Ok(engine)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use geneflow_core::definition::parse_workflow_yaml;
    use geneflow_core::locator::Locator;
    use geneflow_types::job::{JobDefinition, JobStatus, StepStatus};

    use super::*;

    const WORKFLOW: &str = r#"
name: copy-align
version: "1"
inputs:
  reads: {type: Directory}
  reference: {type: File}
final_output: [align]
apps:
  make-index:
    name: make-index
    inputs: {reference: {type: File}}
    exec_methods:
      - name: environment
        if: [{in_path: cp}]
        exec:
          - run: cp
            args: ['${reference}', '${output}']
  concat-align:
    name: concat-align
    inputs: {reads: {type: File}, index: {type: File}}
    exec_methods:
      - name: environment
        exec:
          - run: cat
            args: ['${index}', '${reads}']
            stdout: '${output}'
steps:
  index:
    app: make-index
    template: {reference: '{workflow->reference}', output: ref.idx}
  align:
    app: concat-align
    depend: [index]
    map: {uri: '{workflow->reads}', regex: '(.*)_R1\.fastq'}
    template:
      reads: '{workflow->reads}/{1}_R1.fastq'
      index: '{index->output}/ref.idx'
      output: '{1}.sam'
"#;

    struct Fixture {
        _dir: tempfile::TempDir,
        engine: LocalEngine,
        job: JobDefinition,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let inputs = dir.path().join("inputs");
        std::fs::create_dir_all(inputs.join("reads")).unwrap();
        std::fs::write(inputs.join("reference.fa"), ">chr1\n").unwrap();
        std::fs::write(inputs.join("reads/a_R1.fastq"), "@a\n").unwrap();
        std::fs::write(inputs.join("reads/b_R1.fastq"), "@b\n").unwrap();
        std::fs::write(inputs.join("reads/notes.txt"), "skip me\n").unwrap();

        let engine = open_local_engine(&dir.path().join("data"), {
            let mut config = EngineConfig {
                max_concurrency: 2,
                ..Default::default()
            };
            config.work_uri = Some(dir.path().join("work").display().to_string());
            config.output_uri = Some(dir.path().join("output").display().to_string());
            config
        })
        .await
        .unwrap();

        let mut job = JobDefinition {
            name: Some("Run 42".to_string()),
            ..Default::default()
        };
        job.inputs.insert(
            "reads".to_string(),
            inputs.join("reads").display().to_string(),
        );
        job.inputs.insert(
            "reference".to_string(),
            inputs.join("reference.fa").display().to_string(),
        );
        Fixture {
            _dir: dir,
            engine,
            job,
        }
    }

    #[tokio::test]
    async fn test_workflow_runs_end_to_end() {
        let fx = fixture().await;
        let workflow = parse_workflow_yaml(WORKFLOW, Path::new(".")).unwrap();

        let id = fx.engine.run_job(&workflow, &fx.job).await.unwrap();
        let status = tokio::time::timeout(Duration::from_secs(30), fx.engine.wait_job(&id))
            .await
            .unwrap()
            .unwrap();
        let report = fx.engine.job_status(&id).await.unwrap();
        assert_eq!(status, JobStatus::Completed, "report: {report:?}");
        assert_eq!(report.job.status, JobStatus::Completed);

        let names: Vec<&str> = report.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["index", "align"]);
        assert!(report.steps.iter().all(|s| s.status == StepStatus::Completed));

        let align = &report.steps[1];
        let mut items: Vec<&str> = align.items.iter().map(|i| i.filename.as_str()).collect();
        items.sort();
        assert_eq!(items, vec!["a_R1.fastq", "b_R1.fastq"]);
        let index_dir = Locator::parse(report.steps[0].output_uri.as_deref().unwrap()).unwrap();
        assert!(align
            .items
            .iter()
            .all(|i| i.template["index"].contains(index_dir.chopped_path())));

        let output = Locator::parse(&report.job.output_uri).unwrap();
        let published = Path::new(output.chopped_path()).join("align");
        assert_eq!(
            std::fs::read_to_string(published.join("a.sam")).unwrap(),
            ">chr1\n@a\n"
        );
        assert_eq!(
            std::fs::read_to_string(published.join("b.sam")).unwrap(),
            ">chr1\n@b\n"
        );
        assert!(output.chopped_path().contains("run-42-"));
    }

    #[tokio::test]
    async fn test_failing_command_fails_job() {
        let fx = fixture().await;
        let yaml = WORKFLOW.replace("run: cat", "run: false");
        let workflow = parse_workflow_yaml(&yaml, Path::new(".")).unwrap();

        let id = fx.engine.run_job(&workflow, &fx.job).await.unwrap();
        let status = tokio::time::timeout(Duration::from_secs(30), fx.engine.wait_job(&id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, JobStatus::Failed);

        let report = fx.engine.job_status(&id).await.unwrap();
        assert_eq!(report.failed_steps(), vec!["align"]);
        assert_eq!(report.job.error.as_deref(), Some("failed steps: align"));
        assert_eq!(report.steps[0].status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn test_build_local_engine_reads_config() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "max_concurrency = 3\n").unwrap();
        let engine = build_local_engine(dir.path()).await.unwrap();
        assert_eq!(engine.config().max_concurrency, 3);
        assert!(dir.path().join("geneflow.db").exists());
        assert!(engine.list_jobs(10).await.unwrap().is_empty());
        assert_eq!(engine.contexts(), vec!["local"]);
    }

    #[tokio::test]
    async fn test_gridengine_section_adds_context() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "[gridengine]\nqueue = \"short.q\"\nslots = 2\n",
        )
        .unwrap();
        let engine = build_local_engine(dir.path()).await.unwrap();
        assert_eq!(engine.contexts(), vec!["local", "gridengine"]);
        assert_eq!(
            engine.config().gridengine.as_ref().and_then(|g| g.queue.as_deref()),
            Some("short.q")
        );
    }
}
