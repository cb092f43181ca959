use std::fmt;

use thiserror::Error;

/// Main error type for loading scenarios and checking documents
#[derive(Error, Debug)]
pub enum CheckError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Compilation(#[from] CompilationError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Processing of {input} failed in stage '{stage}': {source}")]
    Processing {
        input: String,
        stage: &'static str,
        #[source]
        source: Box<CheckError>,
    },

    #[error("Scenario repository is not ready (state: {state})")]
    NotReady { state: String },

    #[error("Scenario repository can not be initialized again (state: {state})")]
    AlreadyInitialized { state: String },

    #[error("Concurrent operation error: {details}")]
    Concurrency { details: String },

    #[error("Checking {input} finished without a report")]
    MissingReport { input: String },

    #[error("Request timeout: {input} after {timeout_seconds} seconds")]
    Timeout { input: String, timeout_seconds: u64 },
}

impl CheckError {
    /// Wrap a stage failure so that it is distinguishable from a content outcome
    pub fn processing(input: impl Into<String>, stage: &'static str, source: CheckError) -> Self {
        CheckError::Processing {
            input: input.into(),
            stage,
            source: Box::new(source),
        }
    }

    /// Whether this error stems from a defect in the scenario configuration or its artifacts
    pub fn is_configuration_defect(&self) -> bool {
        match self {
            CheckError::Configuration(_) | CheckError::Compilation(_) => true,
            CheckError::Processing { source, .. } => source.is_configuration_defect(),
            _ => false,
        }
    }
}

/// Defects of the scenario configuration or of the repository layout.
/// Always fatal to initialization.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error(
        "Specified scenario configuration {location} is not supported. This version only supports definitions of framework version {supported}"
    )]
    UnsupportedFramework {
        location: String,
        supported: &'static str,
    },

    #[error("Can not load scenarios from {location} due to {}", violations.join("; "))]
    InvalidScenarioDefinition {
        location: String,
        violations: Vec<String>,
    },

    #[error("Scenario definition {location} declares no fallback report")]
    MissingFallbackReport { location: String },

    #[error("The resolved artifact {artifact} is not within the configured repository {repository}")]
    OutsideRepository { artifact: String, repository: String },

    #[error("Artifact not found: {artifact}")]
    ArtifactNotFound { artifact: String },

    #[error("Invalid artifact URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("Can not read container {container}: {details}")]
    Container { container: String, details: String },
}

/// Kind of artifact an engine compiles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Schema,
    Transform,
    Predicate,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactKind::Schema => write!(f, "schema"),
            ArtifactKind::Transform => write!(f, "transform"),
            ArtifactKind::Predicate => write!(f, "predicate"),
        }
    }
}

/// A compile failure of one artifact, carrying every diagnostic the engine produced.
///
/// Clone so that a memoised failure can be handed to every waiting caller.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Can not compile {kind} {artifact}: {}", diagnostics.join("; "))]
pub struct CompilationError {
    pub kind: ArtifactKind,
    pub artifact: String,
    pub diagnostics: Vec<String>,
}

impl CompilationError {
    pub fn new(kind: ArtifactKind, artifact: impl Into<String>, diagnostics: Vec<String>) -> Self {
        Self {
            kind,
            artifact: artifact.into(),
            diagnostics,
        }
    }
}

/// Engine faults. These are never content outcomes.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Memory allocation failed in the XML engine")]
    MemoryAllocation,

    #[error("Invalid engine input: {details}")]
    InvalidInput { details: String },

    #[error("Transformation {transform} failed: {details}")]
    TransformFailed { transform: String, details: String },

    #[error("Predicate '{expression}' could not be evaluated: {details}")]
    EvaluationFailed { expression: String, details: String },

    #[error("Schema validation internal error: code {code}")]
    ValidationInternal { code: i32 },

    #[error("Document serialization failed")]
    Serialization,

    #[error("Engine {engine} does not support {operation}")]
    Unsupported {
        engine: &'static str,
        operation: String,
    },
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, CheckError>;

/// Result type alias for engine operations
pub type EngineResult<T> = std::result::Result<T, EngineError>;
