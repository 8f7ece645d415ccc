use thiserror::Error;

/// Errors produced while parsing a resource locator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocatorError {
    #[error("malformed location '{location}': {reason}")]
    MalformedLocation { location: String, reason: String },
}

impl LocatorError {
    pub fn malformed(location: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedLocation {
            location: location.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised while substituting template placeholders or expanding a
/// step's map specification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("'{{workflow->{0}}}' is not a workflow input or parameter")]
    UnknownWorkflowValue(String),

    #[error("step '{step}' is not a completed dependency (in '{placeholder}')")]
    NotADependency { step: String, placeholder: String },

    #[error("invalid step reference '{0}', only '->output' may be referenced")]
    InvalidStepReference(String),

    #[error("capture group {{{0}}} referenced outside of a map expansion")]
    CaptureOutsideMap(usize),

    #[error("capture group {{{index}}} out of range ({available} captures available)")]
    CaptureOutOfRange { index: usize, available: usize },

    #[error("undefined variable '${{{0}}}'")]
    UndefinedVariable(String),

    #[error("invalid map regex '{pattern}': {reason}")]
    InvalidRegex { pattern: String, reason: String },

    #[error("map source '{0}' is empty")]
    EmptyMapSource(String),

    #[error("no entry of map source '{source_uri}' matches regex '{pattern}'")]
    NoMapMatches { source_uri: String, pattern: String },

    #[error("map items '{first}' and '{second}' resolve to the same output '{output}'")]
    OverlappingOutput {
        first: String,
        second: String,
        output: String,
    },

    #[error("cannot list map source '{source_uri}': {reason}")]
    MapSource { source_uri: String, reason: String },

    #[error(transparent)]
    Location(#[from] LocatorError),
}

/// Errors from repository operations (used by trait definitions in geneflow-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}
