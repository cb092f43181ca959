//! # scenario-validator Library
//!
//! Scenario-based validation of XML documents. A scenario configuration names, for each kind of
//! document, a match expression, the XML schemas and business-rule transforms to apply, and the
//! transform producing the final report. Artifacts are loaded from a content repository (a
//! directory or an archive) and never from outside of it.

pub mod cache;
pub mod cli;
pub mod config;
pub mod content_repository;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod file_discovery;
pub mod filesystem;
pub mod libxml2;
pub mod output;
pub mod pipeline;
pub mod report;
pub mod resolver;
pub mod scenario;
pub mod scenario_repository;
pub mod tasks;

pub use cache::{ArtifactCache, CacheStats};
pub use cli::{Cli, OutputFormat, VerbosityLevel};
pub use config::{Config, ConfigError, ConfigManager};
pub use content_repository::{ContentRepository, RepositoryLocation};
pub use daemon::DaemonConfig;
pub use engine::{ArtifactResolver, ArtifactSource, Diagnostic, Engine, ParseOutcome, Severity};
pub use error::{
    ArtifactKind, CheckError, CompilationError, ConfigurationError, EngineError, Result,
};
pub use file_discovery::FileDiscovery;
pub use filesystem::ArtifactUri;
pub use libxml2::LibXml2Engine;
pub use output::Output;
pub use pipeline::{Bag, Check, CheckAction, CheckResult, Input};
pub use report::Report;
pub use resolver::ArtifactUriResolver;
pub use scenario_repository::{
    CheckConfiguration, CompileMode, RepositoryState, Scenario, ScenarioRepository,
    ScenarioSelection,
};
