//! Capability interface of the external XML engine.
//!
//! The check pipeline never touches a concrete XML library. Everything it needs from one
//! (parsing, predicate evaluation, schema validation, transformation, serialization) is
//! expressed by [`Engine`], with compiled artifacts as associated types so that an engine
//! keeps full control over their representation.
//!
//! Compiled artifacts (`Schema`, `Predicate`, `Transform`) must be shareable between
//! threads: they are compiled once and then used concurrently by every worker.
//! Documents are per-request values and only need to be movable between threads.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{CompilationError, EngineResult, Result};

/// Prefix to namespace URI bindings used when compiling predicates
pub type NamespaceBindings = BTreeMap<String, String>;

/// Severity of an engine diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
    Fatal,
}

impl Severity {
    /// Code used in the report input document
    pub fn code(&self) -> &'static str {
        match self {
            Severity::Warning => "SEVERITY_WARNING",
            Severity::Error => "SEVERITY_ERROR",
            Severity::Fatal => "SEVERITY_FATAL_ERROR",
        }
    }
}

/// A single located message from parsing, compiling or validating
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
            line: None,
            column: None,
        }
    }

    pub fn at(mut self, line: u32, column: u32) -> Self {
        self.line = (line > 0).then_some(line);
        self.column = (column > 0).then_some(column);
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity >= Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.line, self.column) {
            (Some(line), Some(column)) => write!(f, "[{}:{}] {}", line, column, self.message),
            (Some(line), None) => write!(f, "[{}] {}", line, self.message),
            _ => write!(f, "{}", self.message),
        }
    }
}

/// The loaded bytes of an artifact together with its canonical system identifier
#[derive(Debug, Clone)]
pub struct ArtifactSource {
    pub system_id: String,
    pub content: Arc<[u8]>,
}

impl ArtifactSource {
    pub fn new(system_id: impl Into<String>, content: impl Into<Arc<[u8]>>) -> Self {
        Self {
            system_id: system_id.into(),
            content: content.into(),
        }
    }
}

/// Outcome of parsing a document: either a tree or the syntax errors that prevented one
#[derive(Debug)]
pub enum ParseOutcome<D> {
    Parsed(D),
    Malformed(Vec<Diagnostic>),
}

impl<D> ParseOutcome<D> {
    pub fn is_parsed(&self) -> bool {
        matches!(self, ParseOutcome::Parsed(_))
    }

    pub fn document(&self) -> Option<&D> {
        match self {
            ParseOutcome::Parsed(document) => Some(document),
            ParseOutcome::Malformed(_) => None,
        }
    }

    pub fn syntax_errors(&self) -> &[Diagnostic] {
        match self {
            ParseOutcome::Parsed(_) => &[],
            ParseOutcome::Malformed(errors) => errors,
        }
    }
}

/// Hook the engine calls for every nested artifact reference (includes, imports,
/// `document()` calls). Implementations enforce the repository boundary.
#[cfg_attr(test, mockall::automock)]
pub trait ArtifactResolver: Send + Sync {
    /// Resolve `href` against the document identified by `base` and load it
    fn resolve(&self, href: &str, base: &str) -> Result<ArtifactSource>;

    /// Load an artifact by an already absolute system identifier
    fn load(&self, system_id: &str) -> Result<ArtifactSource>;
}

/// Resolver handle shared with the engine for the duration of an operation
pub type SharedResolver = Arc<dyn ArtifactResolver>;

/// XML processing capabilities required by the validator
pub trait Engine: Send + Sync + 'static {
    type Document: Send;
    type Schema: Send + Sync + 'static;
    type Predicate: Send + Sync + 'static;
    type Transform: Send + Sync + 'static;

    /// Human readable engine name, recorded in the report input
    fn name(&self) -> &str;

    /// Parse bytes into a document. Malformed input is an outcome, not an error.
    fn parse_document(
        &self,
        content: &[u8],
        system_id: &str,
    ) -> EngineResult<ParseOutcome<Self::Document>>;

    fn serialize(&self, document: &Self::Document) -> EngineResult<String>;

    fn compile_predicate(
        &self,
        expression: &str,
        namespaces: &NamespaceBindings,
    ) -> std::result::Result<Self::Predicate, CompilationError>;

    fn evaluate_predicate(
        &self,
        predicate: &Self::Predicate,
        document: &Self::Document,
    ) -> EngineResult<bool>;

    /// Compile a schema from one or more sources. Nested references go through `resolver`.
    fn compile_schema(
        &self,
        sources: &[ArtifactSource],
        resolver: &SharedResolver,
    ) -> std::result::Result<Self::Schema, CompilationError>;

    /// Validate a document, returning every diagnostic (an empty list means valid)
    fn validate(
        &self,
        schema: &Self::Schema,
        document: &Self::Document,
    ) -> EngineResult<Vec<Diagnostic>>;

    fn compile_transform(
        &self,
        source: &ArtifactSource,
        resolver: &SharedResolver,
    ) -> std::result::Result<Self::Transform, CompilationError>;

    fn run_transform(
        &self,
        transform: &Self::Transform,
        document: &Self::Document,
        resolver: &SharedResolver,
    ) -> EngineResult<Self::Document>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_display() {
        let located = Diagnostic::error("unexpected element").at(3, 7);
        assert_eq!(located.to_string(), "[3:7] unexpected element");

        let unlocated = Diagnostic::error("missing root");
        assert_eq!(unlocated.to_string(), "missing root");
    }

    #[test]
    fn test_zero_positions_are_unknown() {
        let diagnostic = Diagnostic::error("x").at(0, 0);
        assert_eq!(diagnostic.line, None);
        assert_eq!(diagnostic.column, None);
    }

    #[test]
    fn test_warnings_are_not_errors() {
        let mut diagnostic = Diagnostic::error("x");
        assert!(diagnostic.is_error());
        diagnostic.severity = Severity::Warning;
        assert!(!diagnostic.is_error());
        diagnostic.severity = Severity::Fatal;
        assert!(diagnostic.is_error());
    }

    #[test]
    fn test_parse_outcome_accessors() {
        let parsed: ParseOutcome<u8> = ParseOutcome::Parsed(1);
        assert!(parsed.is_parsed());
        assert_eq!(parsed.document(), Some(&1));
        assert!(parsed.syntax_errors().is_empty());

        let malformed: ParseOutcome<u8> =
            ParseOutcome::Malformed(vec![Diagnostic::error("eof")]);
        assert!(!malformed.is_parsed());
        assert_eq!(malformed.document(), None);
        assert_eq!(malformed.syntax_errors().len(), 1);
    }
}
