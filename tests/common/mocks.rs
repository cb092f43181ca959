//! Test engine: libxml2 for parsing, XPath and XSD, deterministic stand-ins for transforms.
//!
//! A transform source is interpreted by its content:
//! - containing `<stub:identity` it echoes its input document,
//! - containing `<stub:slow` it echoes its input document after [`SLOW_TRANSFORM_DELAY`],
//! - containing `<stub:fail` running it fails,
//! - containing `<stub:broken` it does not compile,
//! - anything else is the constant output document of the transform.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use scenario_validator::engine::{
    ArtifactSource, Diagnostic, Engine, NamespaceBindings, ParseOutcome, SharedResolver,
};
use scenario_validator::error::{ArtifactKind, CompilationError, EngineError, EngineResult};
use scenario_validator::libxml2::{CompiledSchema, LibXml2Engine, XPathPredicate, XmlDocument};

pub const SLOW_TRANSFORM_DELAY: Duration = Duration::from_millis(1500);

pub enum StubTransform {
    Identity { system_id: String },
    Slow { system_id: String },
    Fail { system_id: String },
    Constant { system_id: String, output: Arc<[u8]> },
}

impl StubTransform {
    pub fn system_id(&self) -> &str {
        match self {
            StubTransform::Identity { system_id }
            | StubTransform::Slow { system_id }
            | StubTransform::Fail { system_id }
            | StubTransform::Constant { system_id, .. } => system_id,
        }
    }
}

#[derive(Default)]
pub struct StubEngine {
    inner: LibXml2Engine,
    pub predicates_compiled: AtomicUsize,
    pub schemas_compiled: AtomicUsize,
    pub transforms_compiled: AtomicUsize,
    pub transforms_run: AtomicUsize,
}

impl StubEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compiled(&self) -> (usize, usize, usize) {
        (
            self.predicates_compiled.load(Ordering::SeqCst),
            self.schemas_compiled.load(Ordering::SeqCst),
            self.transforms_compiled.load(Ordering::SeqCst),
        )
    }

    fn parse_output(&self, content: &[u8], system_id: &str) -> EngineResult<XmlDocument> {
        match self.inner.parse_document(content, system_id)? {
            ParseOutcome::Parsed(document) => Ok(document),
            ParseOutcome::Malformed(errors) => Err(EngineError::TransformFailed {
                transform: system_id.to_string(),
                details: errors
                    .iter()
                    .map(Diagnostic::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            }),
        }
    }
}

impl Engine for StubEngine {
    type Document = XmlDocument;
    type Schema = CompiledSchema;
    type Predicate = XPathPredicate;
    type Transform = StubTransform;

    fn name(&self) -> &str {
        "stub-engine"
    }

    fn parse_document(
        &self,
        content: &[u8],
        system_id: &str,
    ) -> EngineResult<ParseOutcome<Self::Document>> {
        self.inner.parse_document(content, system_id)
    }

    fn serialize(&self, document: &Self::Document) -> EngineResult<String> {
        self.inner.serialize(document)
    }

    fn compile_predicate(
        &self,
        expression: &str,
        namespaces: &NamespaceBindings,
    ) -> Result<Self::Predicate, CompilationError> {
        self.predicates_compiled.fetch_add(1, Ordering::SeqCst);
        self.inner.compile_predicate(expression, namespaces)
    }

    fn evaluate_predicate(
        &self,
        predicate: &Self::Predicate,
        document: &Self::Document,
    ) -> EngineResult<bool> {
        self.inner.evaluate_predicate(predicate, document)
    }

    fn compile_schema(
        &self,
        sources: &[ArtifactSource],
        resolver: &SharedResolver,
    ) -> Result<Self::Schema, CompilationError> {
        self.schemas_compiled.fetch_add(1, Ordering::SeqCst);
        self.inner.compile_schema(sources, resolver)
    }

    fn validate(
        &self,
        schema: &Self::Schema,
        document: &Self::Document,
    ) -> EngineResult<Vec<Diagnostic>> {
        self.inner.validate(schema, document)
    }

    fn compile_transform(
        &self,
        source: &ArtifactSource,
        _resolver: &SharedResolver,
    ) -> Result<Self::Transform, CompilationError> {
        self.transforms_compiled.fetch_add(1, Ordering::SeqCst);
        let text = String::from_utf8_lossy(&source.content);
        let system_id = source.system_id.clone();

        if text.contains("<stub:broken") {
            Err(CompilationError::new(
                ArtifactKind::Transform,
                system_id,
                vec!["stylesheet is broken".to_string()],
            ))
        } else if text.contains("<stub:identity") {
            Ok(StubTransform::Identity { system_id })
        } else if text.contains("<stub:slow") {
            Ok(StubTransform::Slow { system_id })
        } else if text.contains("<stub:fail") {
            Ok(StubTransform::Fail { system_id })
        } else {
            Ok(StubTransform::Constant {
                system_id,
                output: Arc::clone(&source.content),
            })
        }
    }

    fn run_transform(
        &self,
        transform: &Self::Transform,
        document: &Self::Document,
        _resolver: &SharedResolver,
    ) -> EngineResult<Self::Document> {
        self.transforms_run.fetch_add(1, Ordering::SeqCst);
        match transform {
            StubTransform::Identity { system_id } => {
                let echoed = self.inner.serialize(document)?;
                self.parse_output(echoed.as_bytes(), system_id)
            }
            StubTransform::Slow { system_id } => {
                std::thread::sleep(SLOW_TRANSFORM_DELAY);
                let echoed = self.inner.serialize(document)?;
                self.parse_output(echoed.as_bytes(), system_id)
            }
            StubTransform::Fail { system_id } => Err(EngineError::TransformFailed {
                transform: system_id.clone(),
                details: "terminated by stylesheet".to_string(),
            }),
            StubTransform::Constant { system_id, output } => {
                self.parse_output(output, system_id)
            }
        }
    }
}
