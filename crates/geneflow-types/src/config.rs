//! Engine configuration types.
//!
//! `EngineConfig` represents the `config.toml` in the GeneFlow data
//! directory. Every field has a default, so an empty file is valid.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the workflow engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of concurrently running invocations across all jobs.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Per-invocation timeout in seconds. Unset means no timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_timeout_secs: Option<u64>,

    /// Automatic re-runs of a failed map item.
    #[serde(default)]
    pub max_retries: u32,

    /// Default base work location (falls back to `<data_dir>/work`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_uri: Option<String>,

    /// Default base output location (falls back to `<data_dir>/output`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_uri: Option<String>,

    /// How often the CLI refreshes job status while waiting, and how often a
    /// driving engine checks for an out-of-process cancel, in milliseconds.
    #[serde(default = "default_status_poll_ms")]
    pub status_poll_ms: u64,

    /// SQLite database file name, relative to the data directory.
    #[serde(default = "default_database")]
    pub database: String,

    /// Enables the `gridengine` execution context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gridengine: Option<GridEngineConfig>,
}

/// `[gridengine]`: how steps in the `gridengine` context are submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridEngineConfig {
    /// Queue, passed to `qsub -q`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,

    /// Slots, passed to `qsub -pe smp`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slots: Option<u32>,

    /// Extra `qsub` options, split on whitespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub other: Option<String>,

    /// Directory holding `qsub`, `qstat` and `qdel`. Unset searches `PATH`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin_dir: Option<String>,

    /// Interval between `qstat` polls of a submitted job, in milliseconds.
    #[serde(default = "default_grid_poll_ms")]
    pub poll_ms: u64,
}

fn default_grid_poll_ms() -> u64 {
    5000
}

impl Default for GridEngineConfig {
    fn default() -> Self {
        Self {
            queue: None,
            slots: None,
            other: None,
            bin_dir: None,
            poll_ms: default_grid_poll_ms(),
        }
    }
}

fn default_max_concurrency() -> usize {
    4
}

fn default_status_poll_ms() -> u64 {
    2000
}

fn default_database() -> String {
    "geneflow.db".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            invocation_timeout_secs: None,
            max_retries: 0,
            work_uri: None,
            output_uri: None,
            status_poll_ms: default_status_poll_ms(),
            database: default_database(),
            gridengine: None,
        }
    }
}
