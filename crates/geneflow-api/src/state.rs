//! Application state for CLI commands.
//!
//! Pins the engine to the local infrastructure: SQLite job store under the
//! data directory, local filesystem data, and OS processes.

use std::path::PathBuf;

use anyhow::Context;
use geneflow_infra::engine::{LocalEngine, build_local_engine};
use geneflow_infra::filesystem::resolve_data_dir;

pub struct AppState {
    pub engine: LocalEngine,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Resolve the data directory and open the engine over it.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        let engine = build_local_engine(&data_dir)
            .await
            .with_context(|| format!("Failed to open GeneFlow data in '{}'", data_dir.display()))?;
        tracing::debug!(data_dir = %data_dir.display(), "application state ready");
        Ok(Self { engine, data_dir })
    }
}
