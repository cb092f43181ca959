//! Pipeline stages.
//!
//! The five core stages are created by [`Check::new`](crate::pipeline::Check::new). The
//! remaining actions are optional and appended by the command line application.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::engine::{Engine, ParseOutcome};
use crate::error::{EngineError, Result};
use crate::pipeline::{Bag, CheckAction, RuleValidationResult, SchemaValidationResult};
use crate::report::{REPORT_INPUT_NAME, Report, create_report_input};
use crate::scenario_repository::ScenarioRepository;

/// Parses the raw input. Never skipped.
pub struct DocumentParseAction<E: Engine> {
    engine: Arc<E>,
}

impl<E: Engine> DocumentParseAction<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Self { engine }
    }
}

impl<E: Engine> CheckAction<E> for DocumentParseAction<E> {
    fn name(&self) -> &'static str {
        "parse"
    }

    fn check(&self, bag: &mut Bag<E>) -> Result<()> {
        let outcome = self
            .engine
            .parse_document(bag.input().content(), bag.input().name())?;
        if let ParseOutcome::Malformed(errors) = &outcome {
            debug!("{} is not well-formed ({} errors)", bag.input().name(), errors.len());
        }
        bag.parse = Some(outcome);
        Ok(())
    }
}

/// Selects the scenario for a well-formed input
pub struct ScenarioSelectionAction<E: Engine> {
    repository: Arc<ScenarioRepository<E>>,
}

impl<E: Engine> ScenarioSelectionAction<E> {
    pub fn new(repository: Arc<ScenarioRepository<E>>) -> Self {
        Self { repository }
    }
}

impl<E: Engine> CheckAction<E> for ScenarioSelectionAction<E> {
    fn name(&self) -> &'static str {
        "scenario-selection"
    }

    fn is_skipped(&self, bag: &Bag<E>) -> bool {
        !bag.is_well_formed()
    }

    fn check(&self, bag: &mut Bag<E>) -> Result<()> {
        let Some(document) = bag.document() else {
            return Ok(());
        };
        let selection = self.repository.select_scenario(document)?;
        match selection.scenario() {
            Some(scenario) => debug!("Selected scenario {} for {}", scenario.name(), bag.input().name()),
            None => info!(
                "No scenario for {}: {}",
                bag.input().name(),
                selection.failure_reason().unwrap_or_default()
            ),
        }
        bag.selection = selection;
        Ok(())
    }
}

/// Validates against the selected scenario's schema
pub struct SchemaValidationAction<E: Engine> {
    engine: Arc<E>,
}

impl<E: Engine> SchemaValidationAction<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Self { engine }
    }
}

impl<E: Engine> CheckAction<E> for SchemaValidationAction<E> {
    fn name(&self) -> &'static str {
        "schema-validation"
    }

    fn is_skipped(&self, bag: &Bag<E>) -> bool {
        !bag.is_well_formed() || !bag.selection.is_selected()
    }

    fn check(&self, bag: &mut Bag<E>) -> Result<()> {
        let Some(scenario) = bag.scenario().cloned() else {
            return Ok(());
        };
        let schema = scenario.schema()?;
        let Some(document) = bag.document() else {
            return Ok(());
        };
        let diagnostics = self.engine.validate(&schema, document)?;

        bag.schema = Some(SchemaValidationResult {
            resources: scenario.schema_resources().to_vec(),
            diagnostics,
        });
        Ok(())
    }
}

/// Runs every business rule transform of the selected scenario.
///
/// Only runs when schema validation ran and passed. Each rule runs on its own; a rule that
/// flags errors does not keep the others from running.
pub struct SchematronValidationAction<E: Engine> {
    repository: Arc<ScenarioRepository<E>>,
    failed_assert: Arc<E::Predicate>,
}

impl<E: Engine> SchematronValidationAction<E> {
    pub fn new(repository: Arc<ScenarioRepository<E>>, failed_assert: Arc<E::Predicate>) -> Self {
        Self {
            repository,
            failed_assert,
        }
    }
}

impl<E: Engine> CheckAction<E> for SchematronValidationAction<E> {
    fn name(&self) -> &'static str {
        "business-rules"
    }

    fn is_skipped(&self, bag: &Bag<E>) -> bool {
        bag.schema.as_ref().is_none_or(|schema| !schema.is_valid())
    }

    fn check(&self, bag: &mut Bag<E>) -> Result<()> {
        let Some(scenario) = bag.scenario().cloned() else {
            return Ok(());
        };
        let content = self.repository.content()?;
        let engine = content.engine();
        let transforms = scenario.rule_transforms()?;
        let Some(document) = bag.document() else {
            return Ok(());
        };

        let mut results = Vec::with_capacity(transforms.len());
        for (resource, transform) in scenario.rule_resources().iter().zip(transforms) {
            let output = engine.run_transform(transform, document, content.resolver())?;
            let failed = engine.evaluate_predicate(&self.failed_assert, &output)?;
            if failed {
                debug!("{} flags errors in {}", resource.name, bag.input().name());
            }
            results.push(RuleValidationResult {
                resource: resource.clone(),
                output: engine.serialize(&output)?,
                failed,
            });
        }

        bag.rules = results;
        Ok(())
    }
}

/// Builds the report input and runs the report transform. Always runs.
pub struct CreateReportAction<E: Engine> {
    repository: Arc<ScenarioRepository<E>>,
}

impl<E: Engine> CreateReportAction<E> {
    pub fn new(repository: Arc<ScenarioRepository<E>>) -> Self {
        Self { repository }
    }
}

impl<E: Engine> CheckAction<E> for CreateReportAction<E> {
    fn name(&self) -> &'static str {
        "create-report"
    }

    fn check(&self, bag: &mut Bag<E>) -> Result<()> {
        let content = self.repository.content()?;
        let engine = content.engine();

        let report_input = create_report_input(bag, engine.name(), Utc::now())?;
        let system_id = content.location().root().join(REPORT_INPUT_NAME)?.system_id();
        let input_document = match engine.parse_document(report_input.as_bytes(), &system_id)? {
            ParseOutcome::Parsed(document) => document,
            ParseOutcome::Malformed(errors) => {
                return Err(EngineError::InvalidInput {
                    details: format!(
                        "report input is not well-formed: {}",
                        errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
                    ),
                }
                .into());
            }
        };

        let (transform, fallback_report) = match bag.scenario() {
            Some(scenario) => (scenario.report_transform()?, false),
            None => (self.repository.fallback_transform()?, true),
        };
        let report_document = engine.run_transform(&transform, &input_document, content.resolver())?;
        let report_content = engine.serialize(&report_document)?;

        bag.report_input = Some(report_input);
        bag.report = Some(Report::from_bag(bag, fallback_report, report_content));
        Ok(())
    }
}

/// Writes `<input-stem>-report.xml` into an output directory
pub struct SerializeReportAction {
    directory: PathBuf,
}

impl SerializeReportAction {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn report_path(&self, input_stem: &str) -> PathBuf {
        self.directory.join(format!("{}-report.xml", input_stem))
    }
}

impl<E: Engine> CheckAction<E> for SerializeReportAction {
    fn name(&self) -> &'static str {
        "serialize-report"
    }

    fn is_skipped(&self, bag: &Bag<E>) -> bool {
        bag.report.is_none()
    }

    fn check(&self, bag: &mut Bag<E>) -> Result<()> {
        let Some(report) = &bag.report else {
            return Ok(());
        };
        std::fs::create_dir_all(&self.directory)?;
        let path = self.report_path(&bag.input().stem());
        std::fs::write(&path, &report.content)?;
        info!("Report for {} written to {}", bag.input().name(), path.display());
        Ok(())
    }
}

/// Prints the report document to stdout
pub struct PrintReportAction;

impl<E: Engine> CheckAction<E> for PrintReportAction {
    fn name(&self) -> &'static str {
        "print-report"
    }

    fn is_skipped(&self, bag: &Bag<E>) -> bool {
        bag.report.is_none()
    }

    fn check(&self, bag: &mut Bag<E>) -> Result<()> {
        if let Some(report) = &bag.report {
            println!("{}", report.content);
        }
        Ok(())
    }
}

/// Logs the peak memory of the process after each input
pub struct PrintMemoryStats;

impl PrintMemoryStats {
    /// Peak virtual memory in MB, where the platform reports it
    pub fn peak_memory_mb() -> Option<u64> {
        #[cfg(target_os = "linux")]
        {
            if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
                for line in status.lines() {
                    if line.starts_with("VmPeak:")
                        && let Some(kb) = line.split_whitespace().nth(1)
                        && let Ok(kb) = kb.parse::<u64>()
                    {
                        return Some(kb / 1024);
                    }
                }
            }
        }
        None
    }
}

impl<E: Engine> CheckAction<E> for PrintMemoryStats {
    fn name(&self) -> &'static str {
        "memory-stats"
    }

    fn check(&self, bag: &mut Bag<E>) -> Result<()> {
        match Self::peak_memory_mb() {
            Some(mb) => info!("Peak memory after {}: {} MB", bag.input().name(), mb),
            None => warn!("Peak memory is not available on this platform"),
        }
        Ok(())
    }
}
