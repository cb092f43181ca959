mod common;

use std::sync::Arc;

use common::mocks::StubEngine;
use common::test_helpers::*;
use scenario_validator::error::{CheckError, CompilationError, ConfigurationError};
use scenario_validator::filesystem::ArtifactUri;
use scenario_validator::pipeline::{Check, Input};
use scenario_validator::scenario_repository::{
    CheckConfiguration, CompileMode, RepositoryState, ScenarioRepository,
};

fn load(configuration: &CheckConfiguration) -> (ScenarioRepository<StubEngine>, Result<(), CheckError>) {
    let mut repository = ScenarioRepository::new(Arc::new(StubEngine::new()));
    let result = repository.initialize(configuration);
    (repository, result)
}

#[test]
fn test_loaded_repository_metadata() {
    let repository = TestRepository::standard();
    let (scenarios, result) = load(&repository.configuration());
    result.unwrap();

    assert_eq!(scenarios.state(), &RepositoryState::Ready);
    assert_eq!(scenarios.name(), Some("Test scenarios"));
    assert_eq!(scenarios.author(), Some("Validator tests"));
    assert_eq!(scenarios.date(), Some("2026-01-01"));
    let names: Vec<&str> = scenarios.scenarios().iter().map(|s| s.name()).collect();
    assert_eq!(names, vec!["Invoice", "Order"]);

    let invoice = scenarios.scenario("Invoice").unwrap();
    assert_eq!(invoice.match_expression(), "/inv:Invoice");
    assert_eq!(invoice.framework_version(), "1.0.0");
    assert_eq!(
        invoice.schema_resources()[0].location,
        ArtifactUri::file(repository.root().join("xsd/invoice.xsd"))
    );
    assert_eq!(scenarios.fallback_resource().unwrap().name, "Fallback");
}

#[test]
fn test_artifact_outside_repository_is_rejected() {
    let repository = TestRepository::new();
    let outside = tempfile::TempDir::new().unwrap();
    std::fs::write(outside.path().join("evil.xsd"), INVOICE_XSD).unwrap();
    let escape = format!(
        "../{}/evil.xsd",
        outside.path().file_name().unwrap().to_string_lossy()
    );
    repository.write_scenarios(
        &[scenario(
            "Invoice",
            ("inv", INVOICE_NS),
            "/inv:Invoice",
            &escape,
            &[],
            "report/report.xsl",
        )],
        true,
    );

    let (scenarios, result) = load(&repository.configuration());
    let error = result.unwrap_err();
    assert!(matches!(
        error,
        CheckError::Configuration(ConfigurationError::OutsideRepository { .. })
    ));
    assert!(error.to_string().contains("is not within the configured repository"));
    assert!(matches!(scenarios.state(), RepositoryState::Failed(_)));
}

#[test]
fn test_artifacts_resolve_against_explicit_repository() {
    let repository = TestRepository::standard();
    // Locations are relative to the repository, not to the definition
    let configuration = repository
        .configuration()
        .with_repository(ArtifactUri::file(repository.root().join("xsd")));

    let (_, result) = load(&configuration);
    assert!(matches!(
        result,
        Err(CheckError::Configuration(ConfigurationError::OutsideRepository { .. }))
            | Err(CheckError::Configuration(ConfigurationError::ArtifactNotFound { .. }))
    ));
}

#[test]
fn test_container_repository() {
    let archive_dir = tempfile::TempDir::new().unwrap();
    let archive = archive_dir.path().join("repository.zip");
    let definition = scenarios_document(
        &[scenario(
            "Invoice",
            ("inv", INVOICE_NS),
            "/inv:Invoice",
            "xsd/invoice.xsd",
            &["rules/passing.xsl"],
            "report/report.xsl",
        )],
        true,
    );
    let mut entries = vec![("scenarios.xml", definition.as_str())];
    entries.extend(standard_artifacts());
    write_zip(&archive, &entries);

    let location = format!("{}!/scenarios.xml", archive.display());
    let configuration = CheckConfiguration::new(ArtifactUri::parse(&location).unwrap());
    assert!(configuration.repository_root().is_container());

    let (scenarios, result) = load(&configuration);
    result.unwrap();
    let invoice = scenarios.scenario("Invoice").unwrap();
    assert_eq!(
        invoice.schema_resources()[0].location,
        ArtifactUri::container_entry(&archive, "/xsd/invoice.xsd")
    );

    let check = Check::new(Arc::new(scenarios)).unwrap();
    let report = check
        .check(Input::from_bytes("invoice.xml", VALID_INVOICE.as_bytes().to_vec()))
        .unwrap();
    assert!(report.acceptable);
    assert!(report.content.contains("repository.zip!/xsd/invoice.xsd"));
}

#[test]
fn test_container_escape_is_rejected() {
    let archive_dir = tempfile::TempDir::new().unwrap();
    let archive = archive_dir.path().join("repository.zip");
    let definition = scenarios_document(
        &[scenario(
            "Invoice",
            ("inv", INVOICE_NS),
            "/inv:Invoice",
            "../outside.xsd",
            &[],
            "report/report.xsl",
        )],
        true,
    );
    let mut entries = vec![("conf/scenarios.xml", definition.as_str()), ("outside.xsd", INVOICE_XSD)];
    entries.extend(standard_artifacts());
    write_zip(&archive, &entries);

    // The repository root is the definition's directory inside the container
    let location = format!("{}!/conf/scenarios.xml", archive.display());
    let (_, result) = load(&CheckConfiguration::new(ArtifactUri::parse(&location).unwrap()));
    assert!(matches!(
        result,
        Err(CheckError::Configuration(ConfigurationError::OutsideRepository { .. }))
    ));
}

#[test]
fn test_unsupported_framework_version() {
    let repository = TestRepository::new();
    let definition = scenarios_document(&[invoice_scenario()], true)
        .replace("frameworkVersion=\"1.0.0\"", "frameworkVersion=\"2.0.0\"");
    repository.write("scenarios.xml", &definition);

    let (mut scenarios, result) = load(&repository.configuration());
    assert!(matches!(
        result,
        Err(CheckError::Configuration(ConfigurationError::UnsupportedFramework { .. }))
    ));

    // Failed is terminal
    assert!(matches!(
        scenarios.initialize(&repository.configuration()),
        Err(CheckError::AlreadyInitialized { .. })
    ));
    assert!(matches!(
        Check::new(Arc::new(scenarios)),
        Err(CheckError::NotReady { .. })
    ));
}

#[test]
fn test_invalid_definition_reports_every_violation() {
    let repository = TestRepository::new();
    repository.write(
        "scenarios.xml",
        r#"<?xml version="1.0" encoding="UTF-8"?>
<scenarios xmlns="http://www.xoev.de/de/validator/framework/1/scenarios" frameworkVersion="1.0.0">
  <name></name>
  <scenario>
    <name>Invoice</name>
    <validateWithXmlSchema><resource><name>s</name><location>xsd/invoice.xsd</location></resource></validateWithXmlSchema>
    <createReport><resource><name>r</name><location>report/report.xsl</location></resource></createReport>
    <unexpected/>
  </scenario>
</scenarios>"#,
    );

    let (_, result) = load(&repository.configuration());
    match result {
        Err(CheckError::Configuration(ConfigurationError::InvalidScenarioDefinition {
            violations,
            ..
        })) => {
            // An empty definition name and a scenario without a match expression
            assert!(violations.len() >= 2, "{:?}", violations);
            assert!(violations.iter().any(|v| v.contains("minLength")), "{:?}", violations);
            assert!(
                violations.iter().any(|v| v.contains("validateWithXmlSchema")),
                "{:?}",
                violations
            );
        }
        other => panic!("Expected invalid definition, got {:?}", other),
    }
}

#[test]
fn test_missing_fallback_report() {
    let repository = TestRepository::new();
    repository.write_scenarios(&[invoice_scenario()], false);

    let (_, result) = load(&repository.configuration());
    assert!(matches!(
        result,
        Err(CheckError::Configuration(ConfigurationError::MissingFallbackReport { .. }))
    ));
}

#[test]
fn test_missing_artifact() {
    let repository = TestRepository::new();
    repository.write_scenarios(
        &[scenario(
            "Invoice",
            ("inv", INVOICE_NS),
            "/inv:Invoice",
            "xsd/missing.xsd",
            &[],
            "report/report.xsl",
        )],
        true,
    );

    let (_, result) = load(&repository.configuration());
    assert!(matches!(
        result,
        Err(CheckError::Configuration(ConfigurationError::ArtifactNotFound { .. }))
    ));
}

#[test]
fn test_broken_transform_fails_eager_load() {
    let repository = TestRepository::new();
    repository.write_scenarios(
        &[scenario(
            "Invoice",
            ("inv", INVOICE_NS),
            "/inv:Invoice",
            "xsd/invoice.xsd",
            &["rules/broken.xsl"],
            "report/report.xsl",
        )],
        true,
    );

    let (scenarios, result) = load(&repository.configuration());
    match result {
        Err(CheckError::Compilation(CompilationError { artifact, .. })) => {
            assert!(artifact.ends_with("rules/broken.xsl"));
        }
        other => panic!("Expected compilation error, got {:?}", other),
    }
    assert!(matches!(scenarios.state(), RepositoryState::Failed(_)));
}

#[test]
fn test_broken_transform_surfaces_on_first_use_when_lazy() {
    let repository = TestRepository::new();
    repository.write_scenarios(
        &[scenario(
            "Invoice",
            ("inv", INVOICE_NS),
            "/inv:Invoice",
            "xsd/invoice.xsd",
            &["rules/broken.xsl"],
            "report/report.xsl",
        )],
        true,
    );

    let (_, scenarios) = repository.load(CompileMode::Lazy);
    let check = Check::new(scenarios).unwrap();

    let error = check
        .check(Input::from_bytes("invoice.xml", VALID_INVOICE.as_bytes().to_vec()))
        .unwrap_err();
    assert!(error.is_configuration_defect());
    assert!(matches!(
        error,
        CheckError::Processing { stage: "business-rules", .. }
    ));

    // Documents of no scenario are still reported
    let report = check
        .check(Input::from_bytes("unknown.xml", UNKNOWN_DOCUMENT.as_bytes().to_vec()))
        .unwrap();
    assert!(report.fallback_report);
}
