//! In-memory fakes for the core ports, shared by unit tests.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use geneflow_types::error::RepositoryError;
use geneflow_types::job::{JobRecord, JobStatus, MapItemRecord, StepRecord, StepStatus};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::command::plan::Pipeline;
use crate::command::predicate::EnvironmentProbe;
use crate::command::process::{InvocationError, InvocationOutcome, ProcessHandle, ProcessHost};
use crate::data::{DataBackend, StagingError};
use crate::locator::{Locator, Scheme};
use crate::repository::job::{JobRepository, StepUpdate};

// ---------------------------------------------------------------------------
// Probe
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct StaticProbe {
    programs: HashSet<String>,
    files: HashSet<String>,
    dirs: HashSet<String>,
}

impl StaticProbe {
    pub fn with_program(mut self, name: &str) -> Self {
        self.programs.insert(name.to_string());
        self
    }

    pub fn with_file(mut self, path: &str) -> Self {
        self.files.insert(path.to_string());
        self
    }

    pub fn with_dir(mut self, path: &str) -> Self {
        self.dirs.insert(path.to_string());
        self
    }
}

impl EnvironmentProbe for StaticProbe {
    fn in_path(&self, program: &str) -> bool {
        self.programs.contains(program)
    }

    fn file_exists(&self, path: &str) -> bool {
        self.files.contains(path)
    }

    fn dir_exists(&self, path: &str) -> bool {
        self.dirs.contains(path)
    }
}

// ---------------------------------------------------------------------------
// Data backend
// ---------------------------------------------------------------------------

/// A `local`-scheme backend over an in-memory tree of paths. Clones share
/// the same tree.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    files: Arc<Mutex<BTreeSet<String>>>,
    dirs: Arc<Mutex<BTreeSet<String>>>,
}

fn parent_of(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) if path.len() > 1 => Some("/"),
        Some(0) | None => None,
        Some(i) => Some(&path[..i]),
    }
}

impl MemoryBackend {
    /// Paths ending in `/` are created as (empty) directories.
    pub fn with_files(paths: &[&str]) -> Self {
        let backend = Self::default();
        for path in paths {
            if path.len() > 1 && path.ends_with('/') {
                backend.add_dir(path.trim_end_matches('/'));
            } else {
                backend.add_file(path);
            }
        }
        backend
    }

    pub fn add_file(&self, path: &str) {
        if let Some(parent) = parent_of(path) {
            self.add_dir(parent);
        }
        self.files.lock().unwrap().insert(path.to_string());
    }

    pub fn add_dir(&self, path: &str) {
        let mut current = Some(path);
        let mut dirs = self.dirs.lock().unwrap();
        while let Some(dir) = current {
            dirs.insert(dir.to_string());
            current = parent_of(dir);
        }
    }

    /// Whether `path` is a known file or directory.
    pub fn contains(&self, path: &str) -> bool {
        self.files.lock().unwrap().contains(path) || self.dirs.lock().unwrap().contains(path)
    }

    fn is_under(path: &str, root: &str) -> bool {
        path == root || path.starts_with(&format!("{}/", root.trim_end_matches('/')))
    }
}

impl DataBackend for MemoryBackend {
    fn scheme(&self) -> Scheme {
        Scheme::Local
    }

    async fn list(&self, dir: &Locator) -> Result<Vec<String>, StagingError> {
        let root = dir.chopped_path().to_string();
        if !self.dirs.lock().unwrap().contains(&root) {
            return Err(StagingError::NotFound(dir.serialize()));
        }
        let children = |set: &BTreeSet<String>| -> Vec<String> {
            set.iter()
                .filter(|p| parent_of(p) == Some(root.as_str()))
                .filter_map(|p| p.rsplit('/').next().map(str::to_string))
                .collect()
        };
        let mut names = children(&self.files.lock().unwrap());
        names.extend(children(&self.dirs.lock().unwrap()));
        names.sort();
        Ok(names)
    }

    async fn exists(&self, location: &Locator) -> Result<bool, StagingError> {
        let path = location.chopped_path();
        Ok(self.files.lock().unwrap().contains(path) || self.dirs.lock().unwrap().contains(path))
    }

    async fn mkdir(&self, dir: &Locator) -> Result<(), StagingError> {
        self.add_dir(dir.chopped_path());
        Ok(())
    }

    async fn copy(&self, src: &Locator, dst: &Locator) -> Result<(), StagingError> {
        let from = src.chopped_path().to_string();
        let to = dst.chopped_path().to_string();
        let rebase = |p: &str| format!("{to}{}", &p[from.len()..]);

        let files: Vec<String> = self
            .files
            .lock()
            .unwrap()
            .iter()
            .filter(|p| Self::is_under(p, &from))
            .map(|p| rebase(p))
            .collect();
        let dirs: Vec<String> = self
            .dirs
            .lock()
            .unwrap()
            .iter()
            .filter(|p| Self::is_under(p, &from))
            .map(|p| rebase(p))
            .collect();
        if files.is_empty() && dirs.is_empty() {
            return Err(StagingError::NotFound(src.serialize()));
        }
        for d in dirs {
            self.add_dir(&d);
        }
        for f in files {
            self.add_file(&f);
        }
        Ok(())
    }

    async fn delete(&self, location: &Locator) -> Result<(), StagingError> {
        let root = location.chopped_path().to_string();
        self.files.lock().unwrap().retain(|p| !Self::is_under(p, &root));
        self.dirs.lock().unwrap().retain(|p| !Self::is_under(p, &root));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Process host
// ---------------------------------------------------------------------------

/// A host that "runs" pipelines by sleeping.
///
/// Every pipeline is recorded. Pipelines whose command line contains a
/// `fail_when` marker exit with code 1; programs registered with
/// `fail_to_start` fail at spawn. Delays are a base plus a pseudo-random
/// jitter so concurrent completions interleave differently per run.
#[derive(Debug, Clone, Default)]
pub struct ScriptedHost {
    inner: Arc<ScriptedInner>,
}

#[derive(Debug, Default)]
struct ScriptedInner {
    fail_markers: Mutex<Vec<String>>,
    unstartable: Mutex<HashSet<String>>,
    delay: Mutex<Duration>,
    jitter_ms: AtomicU64,
    seed: AtomicU64,
    calls: Mutex<Vec<Pipeline>>,
}

impl ScriptedHost {
    pub fn fail_when(self, marker: &str) -> Self {
        self.inner.fail_markers.lock().unwrap().push(marker.to_string());
        self
    }

    pub fn fail_to_start(self, program: &str) -> Self {
        self.inner.unstartable.lock().unwrap().insert(program.to_string());
        self
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        *self.inner.delay.lock().unwrap() = delay;
        self
    }

    /// Add up to `max_ms` of pseudo-random delay per pipeline.
    pub fn with_jitter(self, max_ms: u64, seed: u64) -> Self {
        self.inner.jitter_ms.store(max_ms, Ordering::SeqCst);
        self.inner.seed.store(seed.max(1), Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> Vec<Pipeline> {
        self.inner.calls.lock().unwrap().clone()
    }

    fn next_jitter(&self) -> Duration {
        let max = self.inner.jitter_ms.load(Ordering::SeqCst);
        if max == 0 {
            return Duration::ZERO;
        }
        // xorshift64
        let mut x = self.inner.seed.load(Ordering::SeqCst).max(1);
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.inner.seed.store(x, Ordering::SeqCst);
        Duration::from_millis(x % (max + 1))
    }
}

impl ProcessHost for ScriptedHost {
    fn spawn(
        &self,
        pipeline: &Pipeline,
        timeout: Option<Duration>,
    ) -> Result<ProcessHandle, InvocationError> {
        if let Some(cmd) = pipeline
            .commands
            .iter()
            .find(|c| self.inner.unstartable.lock().unwrap().contains(&c.program))
        {
            return Err(InvocationError::Spawn {
                program: cmd.program.clone(),
                reason: "No such file or directory".to_string(),
            });
        }
        self.inner.calls.lock().unwrap().push(pipeline.clone());

        let line = pipeline
            .commands
            .iter()
            .map(|c| c.display())
            .collect::<Vec<_>>()
            .join(" | ");
        let fails = self
            .inner
            .fail_markers
            .lock()
            .unwrap()
            .iter()
            .any(|m| line.contains(m.as_str()));
        let delay = *self.inner.delay.lock().unwrap() + self.next_jitter();

        let stop = CancellationToken::new();
        let token = stop.clone();
        let task = tokio::spawn(async move {
            let limit = timeout.unwrap_or(Duration::from_secs(3600));
            tokio::select! {
                _ = token.cancelled() => InvocationOutcome::cancelled(),
                _ = tokio::time::sleep(limit), if delay > limit => InvocationOutcome::timed_out(),
                _ = tokio::time::sleep(delay) => InvocationOutcome::exited(if fails { 1 } else { 0 }),
            }
        });
        Ok(ProcessHandle::new(Some(1), stop, task))
    }
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

/// A status change observed by the in-memory repository, in write order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepEvent {
    pub step: String,
    pub status: StepStatus,
}

#[derive(Debug, Default)]
pub struct InMemoryJobRepository {
    jobs: Mutex<BTreeMap<Uuid, JobRecord>>,
    steps: Mutex<BTreeMap<Uuid, Vec<StepRecord>>>,
    events: Mutex<Vec<StepEvent>>,
}

impl InMemoryJobRepository {
    pub fn events(&self) -> Vec<StepEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl JobRepository for InMemoryJobRepository {
    async fn create_job(&self, job: &JobRecord, steps: &[StepRecord]) -> Result<(), RepositoryError> {
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.contains_key(&job.id) {
            return Err(RepositoryError::Conflict(format!("job {} exists", job.id)));
        }
        jobs.insert(job.id, job.clone());
        self.steps.lock().unwrap().insert(job.id, steps.to_vec());
        Ok(())
    }

    async fn get_job(&self, id: &Uuid) -> Result<Option<JobRecord>, RepositoryError> {
        Ok(self.jobs.lock().unwrap().get(id).cloned())
    }

    async fn list_jobs(&self, limit: u32) -> Result<Vec<JobRecord>, RepositoryError> {
        let mut jobs: Vec<JobRecord> = self.jobs.lock().unwrap().values().cloned().collect();
        jobs.sort_by(|a, b| b.queued_at.cmp(&a.queued_at));
        jobs.truncate(limit as usize);
        Ok(jobs)
    }

    async fn list_steps(&self, job_id: &Uuid) -> Result<Vec<StepRecord>, RepositoryError> {
        let mut steps = self
            .steps
            .lock()
            .unwrap()
            .get(job_id)
            .cloned()
            .unwrap_or_default();
        steps.sort_by_key(|s| s.number);
        Ok(steps)
    }

    async fn transition_job(
        &self,
        id: &Uuid,
        from: &[JobStatus],
        to: JobStatus,
        error: Option<&str>,
    ) -> Result<bool, RepositoryError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(id).ok_or(RepositoryError::NotFound)?;
        if !from.contains(&job.status) {
            return Ok(false);
        }
        job.status = to;
        if let Some(error) = error {
            job.error = Some(error.to_string());
        }
        if to == JobStatus::Running {
            job.started_at = Some(Utc::now());
        }
        if to.is_terminal() {
            job.finished_at = Some(Utc::now());
        }
        Ok(true)
    }

    async fn transition_step(
        &self,
        job_id: &Uuid,
        step: &str,
        from: StepStatus,
        to: StepStatus,
        update: &StepUpdate,
    ) -> Result<bool, RepositoryError> {
        let mut all = self.steps.lock().unwrap();
        let record = all
            .get_mut(job_id)
            .and_then(|steps| steps.iter_mut().find(|s| s.name == step))
            .ok_or(RepositoryError::NotFound)?;
        if record.status != from {
            return Ok(false);
        }
        record.status = to;
        if update.error.is_some() {
            record.error = update.error.clone();
        }
        if update.output_uri.is_some() {
            record.output_uri = update.output_uri.clone();
        }
        if to == StepStatus::Running {
            record.started_at = Some(Utc::now());
        }
        if to.is_terminal() {
            record.finished_at = Some(Utc::now());
        }
        self.events.lock().unwrap().push(StepEvent {
            step: step.to_string(),
            status: to,
        });
        Ok(true)
    }

    async fn update_step_items(
        &self,
        job_id: &Uuid,
        step: &str,
        items: &[MapItemRecord],
    ) -> Result<(), RepositoryError> {
        let mut all = self.steps.lock().unwrap();
        let record = all
            .get_mut(job_id)
            .and_then(|steps| steps.iter_mut().find(|s| s.name == step))
            .ok_or(RepositoryError::NotFound)?;
        record.items = items.to_vec();
        Ok(())
    }
}

/// A PENDING job record with placeholder locations.
pub fn job_record(name: &str) -> JobRecord {
    JobRecord {
        id: Uuid::now_v7(),
        name: name.to_string(),
        workflow_id: Uuid::now_v7(),
        workflow_name: "wf".to_string(),
        workflow_version: "0.1".to_string(),
        status: JobStatus::Pending,
        inputs: BTreeMap::new(),
        parameters: BTreeMap::new(),
        work_uri: "local:/work".to_string(),
        output_uri: "local:/output".to_string(),
        error: None,
        queued_at: Utc::now(),
        started_at: None,
        finished_at: None,
    }
}
