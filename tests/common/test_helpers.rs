use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use scenario_validator::filesystem::ArtifactUri;
use scenario_validator::pipeline::Check;
use scenario_validator::scenario_repository::{CheckConfiguration, CompileMode, ScenarioRepository};
use tempfile::TempDir;

use super::mocks::StubEngine;

pub const INVOICE_NS: &str = "urn:example:invoice";
pub const ORDER_NS: &str = "urn:example:order";

pub const INVOICE_XSD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema"
           targetNamespace="urn:example:invoice"
           xmlns="urn:example:invoice"
           elementFormDefault="qualified">
  <xs:element name="Invoice">
    <xs:complexType>
      <xs:sequence>
        <xs:element name="ID" type="xs:string"/>
        <xs:element name="Amount" type="xs:decimal"/>
      </xs:sequence>
    </xs:complexType>
  </xs:element>
</xs:schema>"#;

pub const ORDER_XSD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema"
           targetNamespace="urn:example:order"
           xmlns="urn:example:order"
           elementFormDefault="qualified">
  <xs:include schemaLocation="order-types.xsd"/>
  <xs:element name="Order" type="OrderType"/>
</xs:schema>"#;

pub const ORDER_TYPES_XSD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema"
           targetNamespace="urn:example:order"
           elementFormDefault="qualified">
  <xs:complexType name="OrderType">
    <xs:sequence>
      <xs:element name="Item" type="xs:string" maxOccurs="unbounded"/>
    </xs:sequence>
  </xs:complexType>
</xs:schema>"#;

pub const RULES_PASSING: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<svrl:schematron-output xmlns:svrl="http://purl.oclc.org/dsdl/svrl">
  <svrl:fired-rule context="/"/>
</svrl:schematron-output>"#;

pub const RULES_FAILING: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<svrl:schematron-output xmlns:svrl="http://purl.oclc.org/dsdl/svrl">
  <svrl:fired-rule context="/"/>
  <svrl:failed-assert test="Amount &gt; 0" location="/Invoice" flag="fatal">
    <svrl:text>The amount must be positive</svrl:text>
  </svrl:failed-assert>
</svrl:schematron-output>"#;

pub const RULES_WARNING: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<svrl:schematron-output xmlns:svrl="http://purl.oclc.org/dsdl/svrl">
  <svrl:failed-assert test="Note" location="/Invoice" flag="warning">
    <svrl:text>A note is recommended</svrl:text>
  </svrl:failed-assert>
</svrl:schematron-output>"#;

pub const TRANSFORM_IDENTITY: &str = r#"<stub:identity xmlns:stub="urn:stub"/>"#;
pub const TRANSFORM_SLOW: &str = r#"<stub:slow xmlns:stub="urn:stub"/>"#;
pub const TRANSFORM_FAIL: &str = r#"<stub:fail xmlns:stub="urn:stub"/>"#;
pub const TRANSFORM_BROKEN: &str = r#"<stub:broken xmlns:stub="urn:stub"/>"#;

pub const NO_SCENARIO_REPORT: &str =
    r#"<report xmlns="urn:example:report" kind="no-scenario"/>"#;

pub const VALID_INVOICE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Invoice xmlns="urn:example:invoice"><ID>42</ID><Amount>10.00</Amount></Invoice>"#;

pub const INVALID_INVOICE: &str = r#"<Invoice xmlns="urn:example:invoice"/>"#;

pub const VALID_ORDER: &str =
    r#"<Order xmlns="urn:example:order"><Item>Pen</Item><Item>Paper</Item></Order>"#;

pub const UNKNOWN_DOCUMENT: &str = r#"<Unknown xmlns="urn:example:unknown"/>"#;

pub const MALFORMED_DOCUMENT: &str = "<Invoice xmlns=\"urn:example:invoice\"><ID>42</Invoice>";

/// Scenario element for the scenarios document
pub fn scenario(
    name: &str,
    namespace: (&str, &str),
    match_expression: &str,
    schema: &str,
    rules: &[&str],
    report: &str,
) -> String {
    let rules: String = rules
        .iter()
        .enumerate()
        .map(|(i, location)| {
            format!(
                "<validateWithSchematron><resource><name>{} rules {}</name><location>{}</location></resource></validateWithSchematron>",
                name,
                i + 1,
                location
            )
        })
        .collect();
    format!(
        r#"<scenario>
    <name>{name}</name>
    <description>{name} documents</description>
    <namespace prefix="{prefix}">{uri}</namespace>
    <match>{match_expression}</match>
    <validateWithXmlSchema><resource><name>{name} schema</name><location>{schema}</location></resource></validateWithXmlSchema>
    {rules}
    <createReport><resource><name>{name} report</name><location>{report}</location></resource></createReport>
  </scenario>"#,
        name = name,
        prefix = namespace.0,
        uri = namespace.1,
        match_expression = match_expression,
        schema = schema,
        rules = rules,
        report = report,
    )
}

pub fn invoice_scenario() -> String {
    scenario(
        "Invoice",
        ("inv", INVOICE_NS),
        "/inv:Invoice",
        "xsd/invoice.xsd",
        &["rules/passing.xsl"],
        "report/report.xsl",
    )
}

pub fn order_scenario() -> String {
    scenario(
        "Order",
        ("ord", ORDER_NS),
        "/ord:Order",
        "xsd/order.xsd",
        &[],
        "report/report.xsl",
    )
}

/// Scenarios document; `fallback` adds the no-scenario report
pub fn scenarios_document(scenarios: &[String], fallback: bool) -> String {
    let fallback = if fallback {
        "<noScenarioReport><resource><name>Fallback</name><location>report/no-scenario.xsl</location></resource></noScenarioReport>"
    } else {
        ""
    };
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<scenarios xmlns="http://www.xoev.de/de/validator/framework/1/scenarios" frameworkVersion="1.0.0">
  <name>Test scenarios</name>
  <author>Validator tests</author>
  <date>2026-01-01</date>
  {}
  {}
</scenarios>"#,
        scenarios.join("\n  "),
        fallback
    )
}

/// Every artifact the test scenarios refer to, relative to the repository root
pub fn standard_artifacts() -> Vec<(&'static str, &'static str)> {
    vec![
        ("xsd/invoice.xsd", INVOICE_XSD),
        ("xsd/order.xsd", ORDER_XSD),
        ("xsd/order-types.xsd", ORDER_TYPES_XSD),
        ("rules/passing.xsl", RULES_PASSING),
        ("rules/failing.xsl", RULES_FAILING),
        ("rules/warning.xsl", RULES_WARNING),
        ("rules/crashing.xsl", TRANSFORM_FAIL),
        ("rules/broken.xsl", TRANSFORM_BROKEN),
        ("report/report.xsl", TRANSFORM_IDENTITY),
        ("report/slow.xsl", TRANSFORM_SLOW),
        ("report/no-scenario.xsl", NO_SCENARIO_REPORT),
    ]
}

/// A repository directory holding the standard artifacts
pub struct TestRepository {
    pub dir: TempDir,
}

impl TestRepository {
    pub fn new() -> Self {
        let repository = Self {
            dir: TempDir::new().unwrap(),
        };
        for (path, content) in standard_artifacts() {
            repository.write(path, content);
        }
        repository
    }

    /// Standard artifacts plus a scenarios document with the invoice and order scenarios
    pub fn standard() -> Self {
        let repository = Self::new();
        repository.write_scenarios(&[invoice_scenario(), order_scenario()], true);
        repository
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, path: &str, content: &str) -> PathBuf {
        let target = self.root().join(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&target, content).unwrap();
        target
    }

    pub fn write_scenarios(&self, scenarios: &[String], fallback: bool) -> PathBuf {
        self.write("scenarios.xml", &scenarios_document(scenarios, fallback))
    }

    pub fn configuration(&self) -> CheckConfiguration {
        CheckConfiguration::new(ArtifactUri::file(self.root().join("scenarios.xml")))
    }

    pub fn load(&self, mode: CompileMode) -> (Arc<StubEngine>, Arc<ScenarioRepository<StubEngine>>) {
        let engine = Arc::new(StubEngine::new());
        let repository = ScenarioRepository::load(
            Arc::clone(&engine),
            &self.configuration().with_compile_mode(mode),
        )
        .unwrap();
        (engine, Arc::new(repository))
    }

    pub fn check(&self) -> Check<StubEngine> {
        let (_, repository) = self.load(CompileMode::Eager);
        Check::new(repository).unwrap()
    }
}

/// Write a zip archive at `path` holding `entries`
pub fn write_zip(path: &Path, entries: &[(&str, &str)]) {
    let file = fs::File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default();
    for (name, content) in entries {
        zip.start_file(*name, options).unwrap();
        zip.write_all(content.as_bytes()).unwrap();
    }
    zip.finish().unwrap();
}

/// Drop the timestamp so that two reports of the same input can be compared
pub fn without_timestamp(report: &str) -> String {
    let timestamp = regex::Regex::new(r"<in:timestamp>[^<]*</in:timestamp>").unwrap();
    timestamp.replace_all(report, "").into_owned()
}
