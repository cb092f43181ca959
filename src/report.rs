//! Report input assembly and the final per-input report.
//!
//! The report input is an XML document aggregating everything the pipeline found for one
//! input. It is handed to the scenario's report transform, or to the fallback report
//! transform when no scenario was selected.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use serde::Serialize;

use crate::engine::{Diagnostic, Engine};
use crate::error::{CheckError, EngineError, Result};
use crate::pipeline::{Bag, RuleValidationResult, SchemaValidationResult};
use crate::scenario::SCENARIOS_NAMESPACE;
use crate::scenario_repository::ResolvedResource;

/// Namespace of the report input document
pub const REPORT_INPUT_NAMESPACE: &str =
    "http://www.xoev.de/de/validator/framework/1/createreportinput";

/// Version written to the report input root element
pub const REPORT_INPUT_FRAMEWORK_VERSION: &str = "1.0.0";

/// Name under which the report input is resolved against the repository root
pub const REPORT_INPUT_NAME: &str = "report-input.xml";

const HASH_ALGORITHM: &str = "SHA-256";

/// Outcome of checking one input
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub input: String,
    pub document_hash: String,
    pub scenario: Option<String>,
    pub selection_failure: Option<String>,
    pub well_formed: bool,
    pub syntax_errors: Vec<Diagnostic>,
    pub schema: Option<SchemaValidationResult>,
    pub rules: Vec<RuleValidationResult>,
    /// Whether the fallback report transform produced `content`
    pub fallback_report: bool,
    pub acceptable: bool,
    /// The serialized report document
    #[serde(skip)]
    pub content: String,
}

impl Report {
    pub fn from_bag<E: Engine>(bag: &Bag<E>, fallback_report: bool, content: String) -> Self {
        Self {
            input: bag.input().name().to_string(),
            document_hash: bag.input().hash(),
            scenario: bag.scenario().map(|scenario| scenario.name().to_string()),
            selection_failure: bag.selection.failure_reason(),
            well_formed: bag.is_well_formed(),
            syntax_errors: bag.syntax_errors().to_vec(),
            schema: bag.schema.clone(),
            rules: bag.rules.clone(),
            fallback_report,
            acceptable: bag.is_acceptable(),
            content,
        }
    }

    /// `None` when schema validation did not run
    pub fn schema_valid(&self) -> Option<bool> {
        self.schema.as_ref().map(SchemaValidationResult::is_valid)
    }

    pub fn failed_rules(&self) -> impl Iterator<Item = &RuleValidationResult> {
        self.rules.iter().filter(|rule| rule.failed)
    }
}

fn write_error(e: impl fmt::Display) -> CheckError {
    EngineError::InvalidInput {
        details: format!("Can not write report input: {}", e),
    }
    .into()
}

struct ReportInputWriter {
    writer: Writer<Vec<u8>>,
}

impl ReportInputWriter {
    fn new() -> Self {
        Self {
            writer: Writer::new(Vec::new()),
        }
    }

    fn event(&mut self, event: Event<'_>) -> Result<()> {
        self.writer.write_event(event).map_err(write_error)
    }

    fn start(&mut self, name: &str) -> Result<()> {
        self.event(Event::Start(BytesStart::new(name)))
    }

    fn end(&mut self, name: &str) -> Result<()> {
        self.event(Event::End(BytesEnd::new(name)))
    }

    fn text_element(&mut self, name: &str, text: &str) -> Result<()> {
        self.start(name)?;
        self.event(Event::Text(BytesText::new(text)))?;
        self.end(name)
    }

    /// Embed an already serialized XML fragment unchanged
    fn fragment(&mut self, xml: &str) -> Result<()> {
        self.event(Event::Text(BytesText::from_escaped(strip_declaration(xml))))
    }

    fn resource(&mut self, resource: &ResolvedResource) -> Result<()> {
        self.start("s:resource")?;
        self.text_element("s:name", &resource.name)?;
        self.text_element("s:location", &resource.location.system_id())?;
        self.end("s:resource")
    }

    fn syntax_error(&mut self, diagnostic: &Diagnostic) -> Result<()> {
        self.start("in:xmlSyntaxError")?;
        self.text_element("in:severityCode", diagnostic.severity.code())?;
        self.text_element("in:message", &diagnostic.message)?;
        if let Some(line) = diagnostic.line {
            self.text_element("in:rowNumber", &line.to_string())?;
        }
        if let Some(column) = diagnostic.column {
            self.text_element("in:columnNumber", &column.to_string())?;
        }
        self.end("in:xmlSyntaxError")
    }

    fn into_string(self) -> Result<String> {
        String::from_utf8(self.writer.into_inner()).map_err(write_error)
    }
}

/// Remove a leading XML declaration so the fragment can be embedded in another document
pub fn strip_declaration(xml: &str) -> &str {
    let trimmed = xml.trim_start();
    if trimmed.starts_with("<?xml")
        && let Some(end) = trimmed.find("?>")
    {
        return trimmed[end + 2..].trim_start();
    }
    trimmed
}

/// Build the report input document for everything recorded in `bag`
pub fn create_report_input<E: Engine>(
    bag: &Bag<E>,
    engine_name: &str,
    timestamp: DateTime<Utc>,
) -> Result<String> {
    let mut w = ReportInputWriter::new();
    w.event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let mut root = BytesStart::new("in:createReportInput");
    root.push_attribute(("xmlns:in", REPORT_INPUT_NAMESPACE));
    root.push_attribute(("xmlns:s", SCENARIOS_NAMESPACE));
    root.push_attribute(("frameworkVersion", REPORT_INPUT_FRAMEWORK_VERSION));
    w.event(Event::Start(root))?;

    w.start("in:engine")?;
    w.text_element("in:name", engine_name)?;
    w.end("in:engine")?;
    w.text_element(
        "in:timestamp",
        &timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
    )?;

    w.start("in:documentIdentification")?;
    w.start("in:documentHash")?;
    w.text_element("in:hashAlgorithm", HASH_ALGORITHM)?;
    w.text_element("in:hashValue", &bag.input().hash())?;
    w.end("in:documentHash")?;
    w.text_element("in:documentReference", bag.input().name())?;
    w.end("in:documentIdentification")?;

    match bag.scenario() {
        Some(scenario) => {
            w.start("s:scenario")?;
            w.text_element("s:name", scenario.name())?;
            if let Some(description) = scenario.description() {
                w.text_element("s:description", description)?;
            }
            w.end("s:scenario")?;
        }
        None => {
            if let Some(reason) = bag.selection.failure_reason() {
                w.text_element("in:noScenarioReason", &reason)?;
            }
        }
    }

    w.start("in:validationResultsWellformedness")?;
    for error in bag.syntax_errors() {
        w.syntax_error(error)?;
    }
    w.end("in:validationResultsWellformedness")?;

    if let Some(schema) = &bag.schema {
        w.start("in:validationResultsXmlSchema")?;
        for resource in &schema.resources {
            w.resource(resource)?;
        }
        for diagnostic in &schema.diagnostics {
            w.syntax_error(diagnostic)?;
        }
        w.end("in:validationResultsXmlSchema")?;
    }

    for rule in &bag.rules {
        w.start("in:validationResultsSchematron")?;
        w.resource(&rule.resource)?;
        w.start("in:results")?;
        w.fragment(&rule.output)?;
        w.end("in:results")?;
        w.end("in:validationResultsSchematron")?;
    }

    w.end("in:createReportInput")?;
    w.into_string()
}
