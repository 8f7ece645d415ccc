//! Workflow, app, and job YAML parsing and validation.
//!
//! Workflows may reference apps by path; [`load_workflow_file`] resolves
//! those paths relative to the workflow file and inlines the parsed app, so
//! every definition leaving this module has its apps resolved.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use geneflow_types::definition::{AppDefinition, AppRef, WorkflowDefinition};
use geneflow_types::job::JobDefinition;
use thiserror::Error;

use crate::dag::{GraphValidationError, validate_workflow};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("parse error: {0}")]
    ParseError(String),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("cannot read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Graph(#[from] GraphValidationError),
}

fn read(path: &Path) -> Result<String, DefinitionError> {
    std::fs::read_to_string(path).map_err(|source| DefinitionError::Io {
        path: path.to_path_buf(),
        source,
    })
}

// ---------------------------------------------------------------------------
// Apps
// ---------------------------------------------------------------------------

/// Parse and validate an app definition.
pub fn parse_app_yaml(yaml: &str) -> Result<AppDefinition, DefinitionError> {
    let app: AppDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::ParseError(e.to_string()))?;
    validate_app(&app)?;
    Ok(app)
}

pub fn load_app_file(path: &Path) -> Result<AppDefinition, DefinitionError> {
    parse_app_yaml(&read(path)?)
}

/// An app needs a name and at least one uniquely named exec method.
pub fn validate_app(app: &AppDefinition) -> Result<(), DefinitionError> {
    if app.name.trim().is_empty() {
        return Err(DefinitionError::ValidationError(
            "app name must not be empty".to_string(),
        ));
    }
    if app.exec_methods.is_empty() {
        return Err(DefinitionError::ValidationError(format!(
            "app '{}' defines no exec methods",
            app.name
        )));
    }
    let mut seen = HashSet::new();
    for method in &app.exec_methods {
        if !seen.insert(method.name.as_str()) {
            return Err(DefinitionError::ValidationError(format!(
                "app '{}' defines exec method '{}' twice",
                app.name, method.name
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Workflows
// ---------------------------------------------------------------------------

/// Parse a workflow, resolving app paths against `base_dir`, and validate it.
pub fn parse_workflow_yaml(yaml: &str, base_dir: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let mut def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::ParseError(e.to_string()))?;

    for (name, app) in def.apps.iter_mut() {
        match app {
            AppRef::Path(relative) => {
                let path = base_dir.join(relative.as_str());
                tracing::debug!(app = %name, path = %path.display(), "loading app definition");
                *app = AppRef::Inline(Box::new(load_app_file(&path)?));
            }
            AppRef::Inline(inline) => validate_app(inline)?,
        }
    }

    validate_definition(&def)?;
    Ok(def)
}

/// Load a workflow file; relative app paths resolve against its directory.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let content = read(path)?;
    let base = path.parent().unwrap_or(Path::new("."));
    parse_workflow_yaml(&content, base)
}

/// Structural checks followed by graph validation.
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if def.name.trim().is_empty() {
        return Err(DefinitionError::ValidationError(
            "workflow name must not be empty".to_string(),
        ));
    }
    if def.version.trim().is_empty() {
        return Err(DefinitionError::ValidationError(format!(
            "workflow '{}' has an empty version",
            def.name
        )));
    }
    if def.steps.is_empty() {
        return Err(DefinitionError::ValidationError(
            "workflow must have at least one step".to_string(),
        ));
    }
    validate_workflow(def)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

pub fn parse_job_yaml(yaml: &str) -> Result<JobDefinition, DefinitionError> {
    serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::ParseError(e.to_string()))
}

pub fn load_job_file(path: &Path) -> Result<JobDefinition, DefinitionError> {
    parse_job_yaml(&read(path)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
