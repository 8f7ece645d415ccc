//! Observability setup for GeneFlow binaries.

pub mod tracing_setup;
