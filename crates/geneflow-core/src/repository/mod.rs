//! Repository trait definitions (ports).
//!
//! The infrastructure layer (geneflow-infra) implements these against
//! SQLite. The core crate never depends on a storage technology.

pub mod job;
