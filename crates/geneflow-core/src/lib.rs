//! Scheduling, resolution, and command logic for GeneFlow.
//!
//! This crate defines the "ports" the infrastructure layer implements
//! (`JobRepository`, `DataBackend`, `ProcessHost`, `EnvironmentProbe`). It
//! depends only on `geneflow-types`, never on `geneflow-infra` or any
//! database crate.

pub mod command;
pub mod dag;
pub mod data;
pub mod definition;
pub mod locator;
pub mod repository;
pub mod scheduler;
pub mod template;

#[cfg(test)]
pub(crate) mod testing;
