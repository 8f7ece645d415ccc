//! Shared domain types for the GeneFlow workflow engine.
//!
//! This crate contains the definition language (workflows, steps, apps,
//! command blocks, predicates), job and step status records, engine
//! configuration, and the error types shared between the core and infra
//! crates.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod command;
pub mod config;
pub mod definition;
pub mod error;
pub mod job;
pub mod slug;
