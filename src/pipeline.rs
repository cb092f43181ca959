//! The check pipeline.
//!
//! A [`Check`] runs an ordered list of [`CheckAction`]s over one [`Bag`] per input. The core
//! stages (parse, scenario selection, schema validation, business rule validation, report
//! creation) always run in that order; additional actions can be placed before or after
//! them. A stage decides on its own whether it is skipped, based on what earlier stages
//! recorded in the bag.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rayon::prelude::*;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::engine::{Diagnostic, Engine, NamespaceBindings, ParseOutcome};
use crate::error::{CheckError, Result};
use crate::report::Report;
use crate::scenario_repository::{ResolvedResource, Scenario, ScenarioRepository, ScenarioSelection};
use crate::tasks::{
    CreateReportAction, DocumentParseAction, SchemaValidationAction, SchematronValidationAction,
    ScenarioSelectionAction,
};

/// Namespace of SVRL, the output format of business rule transforms
pub const SVRL_NAMESPACE: &str = "http://purl.oclc.org/dsdl/svrl";

/// Holds for business rule output that contains at least one error-level failed assertion
pub const FAILED_ASSERT_EXPRESSION: &str =
    "boolean(//svrl:failed-assert[not(@flag) or @flag='error' or @flag='fatal'])";

/// A document to check
#[derive(Debug, Clone)]
pub struct Input {
    name: String,
    content: Arc<[u8]>,
}

impl Input {
    pub fn from_bytes(name: impl Into<String>, content: impl Into<Arc<[u8]>>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read(path)?;
        Ok(Self::from_bytes(path.display().to_string(), content))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Lowercase hex SHA-256 of the content
    pub fn hash(&self) -> String {
        hex::encode(Sha256::digest(&self.content))
    }

    /// File stem of the input name, used to name derived files
    pub fn stem(&self) -> String {
        Path::new(&self.name)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .filter(|stem| !stem.is_empty())
            .unwrap_or_else(|| "input".to_string())
    }
}

/// Result of validating against the scenario's schema
#[derive(Debug, Clone, Serialize)]
pub struct SchemaValidationResult {
    pub resources: Vec<ResolvedResource>,
    pub diagnostics: Vec<Diagnostic>,
}

impl SchemaValidationResult {
    pub fn is_valid(&self) -> bool {
        !self.diagnostics.iter().any(Diagnostic::is_error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| d.is_error())
    }
}

/// Output of one business rule transform
#[derive(Debug, Clone, Serialize)]
pub struct RuleValidationResult {
    pub resource: ResolvedResource,
    /// Serialized transform output
    #[serde(skip)]
    pub output: String,
    /// Whether the output flags at least one error
    pub failed: bool,
}

/// Per-input accumulator. Owned by exactly one pipeline run.
pub struct Bag<E: Engine> {
    input: Input,
    pub parse: Option<ParseOutcome<E::Document>>,
    pub selection: ScenarioSelection<E>,
    pub schema: Option<SchemaValidationResult>,
    pub rules: Vec<RuleValidationResult>,
    pub report_input: Option<String>,
    pub report: Option<Report>,
}

impl<E: Engine> Bag<E> {
    pub fn new(input: Input) -> Self {
        Self {
            input,
            parse: None,
            selection: ScenarioSelection::NotAttempted,
            schema: None,
            rules: Vec::new(),
            report_input: None,
            report: None,
        }
    }

    pub fn input(&self) -> &Input {
        &self.input
    }

    pub fn document(&self) -> Option<&E::Document> {
        self.parse.as_ref().and_then(ParseOutcome::document)
    }

    pub fn is_well_formed(&self) -> bool {
        self.parse.as_ref().is_some_and(ParseOutcome::is_parsed)
    }

    pub fn syntax_errors(&self) -> &[Diagnostic] {
        self.parse
            .as_ref()
            .map(ParseOutcome::syntax_errors)
            .unwrap_or_default()
    }

    pub fn scenario(&self) -> Option<&Arc<Scenario<E>>> {
        self.selection.scenario()
    }

    /// Well-formed, a scenario selected, schema-valid and no business rule flagged an error
    pub fn is_acceptable(&self) -> bool {
        self.is_well_formed()
            && self.selection.is_selected()
            && self.schema.as_ref().is_some_and(SchemaValidationResult::is_valid)
            && !self.rules.iter().any(|rule| rule.failed)
    }

    pub fn into_report(self) -> Option<Report> {
        self.report
    }
}

impl<E: Engine> fmt::Debug for Bag<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bag")
            .field("input", &self.input.name)
            .field("well_formed", &self.is_well_formed())
            .field("selection", &self.selection)
            .field("schema", &self.schema)
            .field("rules", &self.rules)
            .field("report", &self.report.is_some())
            .finish()
    }
}

/// One stage of the pipeline
pub trait CheckAction<E: Engine>: Send + Sync {
    /// Stage name, used in logs and in processing errors
    fn name(&self) -> &'static str;

    /// Whether this stage has nothing to do for the current bag
    fn is_skipped(&self, _bag: &Bag<E>) -> bool {
        false
    }

    /// Run the stage. An error aborts the run for this input.
    fn check(&self, bag: &mut Bag<E>) -> Result<()>;
}

/// Outcome of checking one CLI input
#[derive(Debug)]
pub struct CheckResult {
    pub input: String,
    pub duration: Duration,
    pub outcome: Result<Report>,
}

impl CheckResult {
    pub fn is_acceptable(&self) -> bool {
        self.outcome.as_ref().is_ok_and(|report| report.acceptable)
    }
}

/// The check pipeline bound to one initialized scenario repository
pub struct Check<E: Engine> {
    repository: Arc<ScenarioRepository<E>>,
    pre_actions: Vec<Box<dyn CheckAction<E>>>,
    core_actions: Vec<Box<dyn CheckAction<E>>>,
    post_actions: Vec<Box<dyn CheckAction<E>>>,
    completed: AtomicU64,
}

impl<E: Engine> Check<E> {
    /// Build the core pipeline. The repository must be ready.
    pub fn new(repository: Arc<ScenarioRepository<E>>) -> Result<Self> {
        if !repository.is_ready() {
            return Err(CheckError::NotReady {
                state: repository.state().to_string(),
            });
        }

        let engine = Arc::clone(repository.engine());
        let mut svrl = NamespaceBindings::new();
        svrl.insert("svrl".to_string(), SVRL_NAMESPACE.to_string());
        let failed_assert = Arc::new(engine.compile_predicate(FAILED_ASSERT_EXPRESSION, &svrl)?);

        let core_actions: Vec<Box<dyn CheckAction<E>>> = vec![
            Box::new(DocumentParseAction::new(Arc::clone(&engine))),
            Box::new(ScenarioSelectionAction::new(Arc::clone(&repository))),
            Box::new(SchemaValidationAction::new(Arc::clone(&engine))),
            Box::new(SchematronValidationAction::new(
                Arc::clone(&repository),
                failed_assert,
            )),
            Box::new(CreateReportAction::new(Arc::clone(&repository))),
        ];

        Ok(Self {
            repository,
            pre_actions: Vec::new(),
            core_actions,
            post_actions: Vec::new(),
            completed: AtomicU64::new(0),
        })
    }

    /// Add an action that runs before the core stages
    pub fn with_pre_action(mut self, action: impl CheckAction<E> + 'static) -> Self {
        self.pre_actions.push(Box::new(action));
        self
    }

    /// Add an action that runs after the report has been created
    pub fn with_post_action(mut self, action: impl CheckAction<E> + 'static) -> Self {
        self.post_actions.push(Box::new(action));
        self
    }

    pub fn repository(&self) -> &Arc<ScenarioRepository<E>> {
        &self.repository
    }

    /// Names of all stages in execution order
    pub fn action_names(&self) -> Vec<&'static str> {
        self.actions().map(|action| action.name()).collect()
    }

    /// Number of inputs checked without a processing error
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    fn actions(&self) -> impl Iterator<Item = &Box<dyn CheckAction<E>>> {
        self.pre_actions
            .iter()
            .chain(&self.core_actions)
            .chain(&self.post_actions)
    }

    /// Run every stage over a fresh bag for `input`
    pub fn check_input(&self, input: Input) -> Result<Bag<E>> {
        let mut bag = Bag::new(input);

        for action in self.actions() {
            if action.is_skipped(&bag) {
                debug!("Skipping {} for {}", action.name(), bag.input().name());
                continue;
            }
            action
                .check(&mut bag)
                .map_err(|e| CheckError::processing(bag.input().name(), action.name(), e))?;
        }

        self.completed.fetch_add(1, Ordering::Relaxed);
        Ok(bag)
    }

    /// Check `input` and return its report
    pub fn check(&self, input: Input) -> Result<Report> {
        let name = input.name().to_string();
        self.check_input(input)?
            .into_report()
            .ok_or(CheckError::MissingReport { input: name })
    }

    /// Check many files on a dedicated pool of `threads` workers
    pub fn check_all(&self, paths: &[PathBuf], threads: usize) -> Result<Vec<CheckResult>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .build()
            .map_err(|e| CheckError::Concurrency {
                details: format!("Failed to create worker pool: {}", e),
            })?;

        Ok(pool.install(|| {
            paths
                .par_iter()
                .map(|path| {
                    let start = Instant::now();
                    let outcome = Input::from_path(path)
                        .map_err(|e| CheckError::processing(path.display().to_string(), "read", e))
                        .and_then(|input| self.check(input));
                    CheckResult {
                        input: path.display().to_string(),
                        duration: start.elapsed(),
                        outcome,
                    }
                })
                .collect()
        }))
    }
}
