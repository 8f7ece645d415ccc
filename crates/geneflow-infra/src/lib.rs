//! Infrastructure layer for GeneFlow.
//!
//! Contains implementations of the port traits defined in `geneflow-core`:
//! SQLite job storage, the local-filesystem data backend, the tokio process
//! host, and the system environment probe. Also loads configuration and
//! assembles a ready-to-use local engine.

pub mod config;
pub mod data;
pub mod engine;
pub mod filesystem;
pub mod process;
pub mod sqlite;
