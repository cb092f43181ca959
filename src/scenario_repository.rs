//! Scenario loading and selection.
//!
//! A [`ScenarioRepository`] reads one scenario configuration, checks it, resolves every
//! artifact location it names against the repository root and compiles what it needs.
//! Afterwards it is shared read-only between workers; the only mutation left is the
//! once-only compilation of artifacts in [`CompileMode::Lazy`].

use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::content_repository::{ContentRepository, DEFAULT_ARTIFACT_CACHE_ENTRIES, RepositoryLocation};
use crate::engine::{ArtifactSource, Engine, NamespaceBindings, ParseOutcome};
use crate::error::{CheckError, ConfigurationError, Result};
use crate::filesystem::ArtifactUri;
use crate::scenario::{
    Resource, SCENARIOS_SCHEMA, SCENARIOS_SCHEMA_ID, ScenarioDefinition, ScenarioDefinitions,
    check_framework_version,
};

/// Lifecycle of a [`ScenarioRepository`]. `Failed` is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryState {
    Uninitialized,
    Loading,
    Ready,
    Failed(String),
}

impl fmt::Display for RepositoryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepositoryState::Uninitialized => write!(f, "uninitialized"),
            RepositoryState::Loading => write!(f, "loading"),
            RepositoryState::Ready => write!(f, "ready"),
            RepositoryState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// When scenario artifacts are compiled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompileMode {
    /// Everything is compiled during initialization
    #[default]
    Eager,
    /// Predicates, schemas and transforms are compiled on first use
    Lazy,
}

/// What to load: the scenario definition and the repository its artifacts live in
#[derive(Debug, Clone, PartialEq)]
pub struct CheckConfiguration {
    pub scenario_definition: ArtifactUri,
    pub scenario_repository: Option<ArtifactUri>,
    pub compile_mode: CompileMode,
    pub artifact_cache_entries: u64,
}

impl CheckConfiguration {
    pub fn new(scenario_definition: ArtifactUri) -> Self {
        Self {
            scenario_definition,
            scenario_repository: None,
            compile_mode: CompileMode::default(),
            artifact_cache_entries: DEFAULT_ARTIFACT_CACHE_ENTRIES,
        }
    }

    pub fn with_repository(mut self, repository: ArtifactUri) -> Self {
        self.scenario_repository = Some(repository);
        self
    }

    pub fn with_compile_mode(mut self, compile_mode: CompileMode) -> Self {
        self.compile_mode = compile_mode;
        self
    }

    /// The configured repository, or the directory holding the scenario definition.
    /// A definition inside a container yields a root inside the same container.
    pub fn repository_root(&self) -> ArtifactUri {
        self.scenario_repository.clone().unwrap_or_else(|| {
            self.scenario_definition
                .parent()
                .unwrap_or_else(|| self.scenario_definition.clone())
        })
    }
}

/// A named artifact reference, resolved against the repository root
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedResource {
    pub name: String,
    #[serde(serialize_with = "serialize_uri")]
    pub location: ArtifactUri,
}

fn serialize_uri<S: serde::Serializer>(uri: &ArtifactUri, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&uri.system_id())
}

impl ResolvedResource {
    fn resolve<E: Engine>(content: &ContentRepository<E>, resource: &Resource) -> Result<Self> {
        Ok(Self {
            name: resource.name.clone(),
            location: content.resolve_artifact(&resource.location)?,
        })
    }
}

/// One loaded scenario. Artifact locations are resolved at load time; compiled artifacts
/// are created at most once, either during initialization or on first use.
pub struct Scenario<E: Engine> {
    name: String,
    description: Option<String>,
    framework_version: String,
    match_expression: String,
    namespaces: NamespaceBindings,
    schemas: Vec<ResolvedResource>,
    rules: Vec<ResolvedResource>,
    report: ResolvedResource,
    content: Arc<ContentRepository<E>>,
    predicate: OnceCell<Arc<E::Predicate>>,
    schema: OnceCell<Arc<E::Schema>>,
    rule_transforms: OnceCell<Vec<Arc<E::Transform>>>,
    report_transform: OnceCell<Arc<E::Transform>>,
}

impl<E: Engine> Scenario<E> {
    fn resolve(
        definition: &ScenarioDefinition,
        framework_version: &str,
        content: &Arc<ContentRepository<E>>,
    ) -> Result<Self> {
        let schemas = definition
            .validate_with_xml_schema
            .resources
            .iter()
            .map(|resource| ResolvedResource::resolve(content, resource))
            .collect::<Result<Vec<_>>>()?;
        let rules = definition
            .business_rules
            .iter()
            .map(|reference| ResolvedResource::resolve(content, &reference.resource))
            .collect::<Result<Vec<_>>>()?;
        let report = ResolvedResource::resolve(content, &definition.create_report.resource)?;

        Ok(Self {
            name: definition.name.clone(),
            description: definition.description.clone(),
            framework_version: framework_version.to_string(),
            match_expression: definition.match_expression.trim().to_string(),
            namespaces: definition.namespace_bindings(),
            schemas,
            rules,
            report,
            content: Arc::clone(content),
            predicate: OnceCell::new(),
            schema: OnceCell::new(),
            rule_transforms: OnceCell::new(),
            report_transform: OnceCell::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn framework_version(&self) -> &str {
        &self.framework_version
    }

    pub fn match_expression(&self) -> &str {
        &self.match_expression
    }

    pub fn namespaces(&self) -> &NamespaceBindings {
        &self.namespaces
    }

    pub fn schema_resources(&self) -> &[ResolvedResource] {
        &self.schemas
    }

    pub fn rule_resources(&self) -> &[ResolvedResource] {
        &self.rules
    }

    pub fn report_resource(&self) -> &ResolvedResource {
        &self.report
    }

    /// The compiled match predicate
    pub fn predicate(&self) -> Result<Arc<E::Predicate>> {
        self.predicate
            .get_or_try_init(|| {
                debug!("Compiling match expression of scenario {}", self.name);
                self.content
                    .compile_predicate(&self.match_expression, &self.namespaces)
                    .map(Arc::new)
            })
            .cloned()
    }

    /// The compiled schema built from all schema resources
    pub fn schema(&self) -> Result<Arc<E::Schema>> {
        self.schema
            .get_or_try_init(|| {
                let locations: Vec<ArtifactUri> =
                    self.schemas.iter().map(|r| r.location.clone()).collect();
                self.content.load_schema(&locations)
            })
            .cloned()
    }

    /// The compiled business rule transforms, in declaration order
    pub fn rule_transforms(&self) -> Result<&[Arc<E::Transform>]> {
        self.rule_transforms
            .get_or_try_init(|| {
                self.rules
                    .iter()
                    .map(|rule| self.content.load_transform(&rule.location))
                    .collect()
            })
            .map(Vec::as_slice)
    }

    /// The compiled report transform
    pub fn report_transform(&self) -> Result<Arc<E::Transform>> {
        self.report_transform
            .get_or_try_init(|| self.content.load_transform(&self.report.location))
            .cloned()
    }

    /// Compile every artifact of this scenario now
    pub fn compile(&self) -> Result<()> {
        self.predicate()?;
        self.schema()?;
        self.rule_transforms()?;
        self.report_transform()?;
        Ok(())
    }

    /// Whether every artifact has been compiled
    pub fn is_compiled(&self) -> bool {
        self.predicate.get().is_some()
            && self.schema.get().is_some()
            && self.rule_transforms.get().is_some()
            && self.report_transform.get().is_some()
    }
}

impl<E: Engine> fmt::Debug for Scenario<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scenario")
            .field("name", &self.name)
            .field("match_expression", &self.match_expression)
            .field("schemas", &self.schemas)
            .field("rules", &self.rules)
            .field("report", &self.report)
            .field("compiled", &self.is_compiled())
            .finish()
    }
}

/// Outcome of scenario selection. Failing to select is an expected outcome, not an error.
pub enum ScenarioSelection<E: Engine> {
    /// Selection did not run, because the input is not well-formed
    NotAttempted,
    Selected(Arc<Scenario<E>>),
    NoMatch,
    Ambiguous { matches: usize },
}

impl<E: Engine> ScenarioSelection<E> {
    pub fn scenario(&self) -> Option<&Arc<Scenario<E>>> {
        match self {
            ScenarioSelection::Selected(scenario) => Some(scenario),
            _ => None,
        }
    }

    pub fn is_selected(&self) -> bool {
        matches!(self, ScenarioSelection::Selected(_))
    }

    /// Human-readable reason when no single scenario was selected
    pub fn failure_reason(&self) -> Option<String> {
        match self {
            ScenarioSelection::Selected(_) => None,
            ScenarioSelection::NotAttempted => {
                Some("No scenario selected since the document is not well-formed".to_string())
            }
            ScenarioSelection::NoMatch => {
                Some("None of the loaded scenarios matches the specified document".to_string())
            }
            ScenarioSelection::Ambiguous { matches } => {
                Some(format!("{} scenarios match the specified document", matches))
            }
        }
    }
}

impl<E: Engine> Default for ScenarioSelection<E> {
    fn default() -> Self {
        ScenarioSelection::NotAttempted
    }
}

impl<E: Engine> Clone for ScenarioSelection<E> {
    fn clone(&self) -> Self {
        match self {
            ScenarioSelection::NotAttempted => ScenarioSelection::NotAttempted,
            ScenarioSelection::Selected(scenario) => ScenarioSelection::Selected(Arc::clone(scenario)),
            ScenarioSelection::NoMatch => ScenarioSelection::NoMatch,
            ScenarioSelection::Ambiguous { matches } => ScenarioSelection::Ambiguous { matches: *matches },
        }
    }
}

impl<E: Engine> fmt::Debug for ScenarioSelection<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScenarioSelection::NotAttempted => write!(f, "NotAttempted"),
            ScenarioSelection::Selected(scenario) => write!(f, "Selected({})", scenario.name()),
            ScenarioSelection::NoMatch => write!(f, "NoMatch"),
            ScenarioSelection::Ambiguous { matches } => write!(f, "Ambiguous({})", matches),
        }
    }
}

struct LoadedScenarios<E: Engine> {
    content: Arc<ContentRepository<E>>,
    definition: ArtifactUri,
    name: String,
    author: Option<String>,
    date: Option<String>,
    compile_mode: CompileMode,
    scenarios: Vec<Arc<Scenario<E>>>,
    fallback: ResolvedResource,
    fallback_transform: Arc<E::Transform>,
}

/// The loaded scenario configuration
pub struct ScenarioRepository<E: Engine> {
    engine: Arc<E>,
    state: RepositoryState,
    loaded: Option<LoadedScenarios<E>>,
}

impl<E: Engine> fmt::Debug for ScenarioRepository<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScenarioRepository")
            .field("state", &self.state)
            .field("loaded", &self.loaded.is_some())
            .finish()
    }
}

impl<E: Engine> ScenarioRepository<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Self {
            engine,
            state: RepositoryState::Uninitialized,
            loaded: None,
        }
    }

    /// Create and initialize in one step
    pub fn load(engine: Arc<E>, configuration: &CheckConfiguration) -> Result<Self> {
        let mut repository = Self::new(engine);
        repository.initialize(configuration)?;
        Ok(repository)
    }

    pub fn state(&self) -> &RepositoryState {
        &self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == RepositoryState::Ready
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    /// Load the scenario configuration. Only allowed once, from `Uninitialized`.
    pub fn initialize(&mut self, configuration: &CheckConfiguration) -> Result<()> {
        if self.state != RepositoryState::Uninitialized {
            return Err(CheckError::AlreadyInitialized {
                state: self.state.to_string(),
            });
        }

        self.state = RepositoryState::Loading;
        match self.load_scenarios(configuration) {
            Ok(loaded) => {
                self.loaded = Some(loaded);
                self.state = RepositoryState::Ready;
                Ok(())
            }
            Err(e) => {
                self.state = RepositoryState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    fn load_scenarios(&self, configuration: &CheckConfiguration) -> Result<LoadedScenarios<E>> {
        let definition = &configuration.scenario_definition;
        let location = definition.system_id();
        info!("Loading scenarios from {}", location);

        let bytes = definition.read()?;
        check_framework_version(&bytes, &location)?;

        let root = RepositoryLocation::new(configuration.repository_root())?;
        let content = Arc::new(ContentRepository::with_cache_capacity(
            Arc::clone(&self.engine),
            root,
            configuration.artifact_cache_entries,
        ));
        info!("Loading scenario content from {}", content.location().root());

        self.validate_definition(&content, &bytes, &location)?;
        let text = std::str::from_utf8(&bytes).map_err(|e| {
            ConfigurationError::InvalidScenarioDefinition {
                location: location.clone(),
                violations: vec![e.to_string()],
            }
        })?;
        let definitions = ScenarioDefinitions::from_xml(text, &location)?;

        info!(
            "Loaded scenarios for {} by {} from {}. The following scenarios are available:\n\n{}",
            definitions.name,
            definitions.author.as_deref().unwrap_or("unknown"),
            definitions.date.as_deref().unwrap_or("unknown"),
            definitions
                .scenarios
                .iter()
                .map(|s| format!("  * {}", s.name))
                .collect::<Vec<_>>()
                .join("\n")
        );

        let scenarios = definitions
            .scenarios
            .iter()
            .map(|d| Scenario::resolve(d, &definitions.framework_version, &content).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        let fallback = definitions
            .no_scenario_report
            .as_ref()
            .ok_or_else(|| ConfigurationError::MissingFallbackReport {
                location: location.clone(),
            })?;
        let fallback = ResolvedResource::resolve(&content, &fallback.resource)?;
        let fallback_transform = content.load_transform(&fallback.location)?;

        if configuration.compile_mode == CompileMode::Eager {
            for scenario in &scenarios {
                scenario.compile()?;
            }
        }

        Ok(LoadedScenarios {
            content,
            definition: definition.clone(),
            name: definitions.name,
            author: definitions.author,
            date: definitions.date,
            compile_mode: configuration.compile_mode,
            scenarios,
            fallback,
            fallback_transform,
        })
    }

    /// Validate the definition against the bundled scenarios schema, collecting every violation
    fn validate_definition(
        &self,
        content: &ContentRepository<E>,
        bytes: &[u8],
        location: &str,
    ) -> Result<()> {
        let schema = content.compile_builtin_schema(&ArtifactSource::new(
            SCENARIOS_SCHEMA_ID,
            SCENARIOS_SCHEMA.as_bytes(),
        ))?;

        let violations: Vec<String> = match self.engine.parse_document(bytes, location)? {
            ParseOutcome::Malformed(errors) => errors.iter().map(ToString::to_string).collect(),
            ParseOutcome::Parsed(document) => self
                .engine
                .validate(&schema, &document)?
                .iter()
                .filter(|d| d.is_error())
                .map(ToString::to_string)
                .collect(),
        };

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ConfigurationError::InvalidScenarioDefinition {
                location: location.to_string(),
                violations,
            }
            .into())
        }
    }

    fn loaded(&self) -> Result<&LoadedScenarios<E>> {
        match (&self.state, &self.loaded) {
            (RepositoryState::Ready, Some(loaded)) => Ok(loaded),
            (state, _) => Err(CheckError::NotReady {
                state: state.to_string(),
            }),
        }
    }

    /// Select the single scenario whose match expression holds for `document`.
    ///
    /// Every scenario is evaluated in declaration order. An evaluation error is logged and
    /// counts as no match for that scenario; a compile error of a lazily compiled predicate
    /// is a configuration defect and propagates.
    pub fn select_scenario(&self, document: &E::Document) -> Result<ScenarioSelection<E>> {
        let loaded = self.loaded()?;
        let mut matches = Vec::new();

        for scenario in &loaded.scenarios {
            let predicate = scenario.predicate()?;
            match self.engine.evaluate_predicate(&predicate, document) {
                Ok(true) => matches.push(Arc::clone(scenario)),
                Ok(false) => {}
                Err(e) => error!(
                    "Error evaluating match expression of scenario {}: {}",
                    scenario.name(),
                    e
                ),
            }
        }

        Ok(match matches.len() {
            0 => ScenarioSelection::NoMatch,
            1 => matches
                .pop()
                .map_or(ScenarioSelection::NoMatch, ScenarioSelection::Selected),
            n => ScenarioSelection::Ambiguous { matches: n },
        })
    }

    /// The loaded scenarios in declaration order; empty unless ready
    pub fn scenarios(&self) -> &[Arc<Scenario<E>>] {
        self.loaded
            .as_ref()
            .map(|loaded| loaded.scenarios.as_slice())
            .unwrap_or_default()
    }

    pub fn scenario(&self, name: &str) -> Option<&Arc<Scenario<E>>> {
        self.scenarios().iter().find(|s| s.name() == name)
    }

    pub fn content(&self) -> Result<&Arc<ContentRepository<E>>> {
        Ok(&self.loaded()?.content)
    }

    /// The transform producing the report when no scenario was selected
    pub fn fallback_transform(&self) -> Result<Arc<E::Transform>> {
        Ok(Arc::clone(&self.loaded()?.fallback_transform))
    }

    pub fn fallback_resource(&self) -> Result<&ResolvedResource> {
        Ok(&self.loaded()?.fallback)
    }

    /// Name of the loaded configuration
    pub fn name(&self) -> Option<&str> {
        self.loaded.as_ref().map(|loaded| loaded.name.as_str())
    }

    pub fn author(&self) -> Option<&str> {
        self.loaded.as_ref().and_then(|loaded| loaded.author.as_deref())
    }

    pub fn date(&self) -> Option<&str> {
        self.loaded.as_ref().and_then(|loaded| loaded.date.as_deref())
    }

    pub fn definition(&self) -> Option<&ArtifactUri> {
        self.loaded.as_ref().map(|loaded| &loaded.definition)
    }

    pub fn compile_mode(&self) -> Option<CompileMode> {
        self.loaded.as_ref().map(|loaded| loaded.compile_mode)
    }
}
