//! Data directory layout.

use std::path::{Path, PathBuf};

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `GENEFLOW_DATA_DIR` environment variable
/// 2. `~/.geneflow`
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("GENEFLOW_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".geneflow");
    }

    // Last resort: current directory
    PathBuf::from(".geneflow")
}

/// SQLite connection URL for `database` under `data_dir`.
pub fn database_url(data_dir: &Path, database: &str) -> String {
    format!("sqlite://{}?mode=rwc", data_dir.join(database).display())
}
