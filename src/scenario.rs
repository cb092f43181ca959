//! Scenario configuration document model.
//!
//! A scenario configuration is an XML document in the scenarios namespace:
//!
//! ```xml
//! <scenarios xmlns="http://www.xoev.de/de/validator/framework/1/scenarios" frameworkVersion="1.0.0">
//!   <name>Invoices</name>
//!   <scenario>
//!     <name>Invoice</name>
//!     <namespace prefix="inv">urn:example:invoice</namespace>
//!     <match>/inv:Invoice</match>
//!     <validateWithXmlSchema>
//!       <resource><name>Invoice schema</name><location>xsd/invoice.xsd</location></resource>
//!     </validateWithXmlSchema>
//!     <validateWithSchematron>
//!       <resource><name>Invoice rules</name><location>rules/invoice.xsl</location></resource>
//!     </validateWithSchematron>
//!     <createReport>
//!       <resource><name>Report</name><location>report/report.xsl</location></resource>
//!     </createReport>
//!   </scenario>
//!   <noScenarioReport>
//!     <resource><name>Fallback</name><location>report/no-scenario.xsl</location></resource>
//!   </noScenarioReport>
//! </scenarios>
//! ```

use quick_xml::NsReader;
use quick_xml::events::Event;
use quick_xml::name::{Namespace, ResolveResult};
use serde::{Deserialize, Serialize};

use crate::engine::NamespaceBindings;
use crate::error::ConfigurationError;

/// Major framework version this build understands
pub const SUPPORTED_MAJOR_VERSION: &str = "1";

/// Namespace of scenario configuration documents
pub const SCENARIOS_NAMESPACE: &str = "http://www.xoev.de/de/validator/framework/1/scenarios";

/// Schema every scenario configuration is validated against before use
pub const SCENARIOS_SCHEMA: &str = include_str!("../resources/scenarios.xsd");

/// System identifier under which the bundled schema is handed to the engine
pub const SCENARIOS_SCHEMA_ID: &str = "builtin:scenarios.xsd";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioDefinitions {
    #[serde(rename = "@frameworkVersion")]
    pub framework_version: String,
    pub name: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "scenario", default)]
    pub scenarios: Vec<ScenarioDefinition>,
    #[serde(default)]
    pub no_scenario_report: Option<ResourceReference>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "namespace", default)]
    pub namespaces: Vec<NamespaceDeclaration>,
    #[serde(rename = "match")]
    pub match_expression: String,
    pub validate_with_xml_schema: SchemaValidationDefinition,
    #[serde(rename = "validateWithSchematron", default)]
    pub business_rules: Vec<ResourceReference>,
    pub create_report: ResourceReference,
}

impl ScenarioDefinition {
    pub fn namespace_bindings(&self) -> NamespaceBindings {
        self.namespaces
            .iter()
            .map(|ns| (ns.prefix.clone(), ns.uri.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceDeclaration {
    #[serde(rename = "@prefix")]
    pub prefix: String,
    #[serde(rename = "$text")]
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaValidationDefinition {
    #[serde(rename = "resource")]
    pub resources: Vec<Resource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceReference {
    pub resource: Resource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    pub location: String,
}

impl ScenarioDefinitions {
    /// Deserialize a scenario configuration that has already passed schema validation
    pub fn from_xml(content: &str, location: &str) -> Result<Self, ConfigurationError> {
        quick_xml::de::from_str(content).map_err(|e| {
            ConfigurationError::InvalidScenarioDefinition {
                location: location.to_string(),
                violations: vec![e.to_string()],
            }
        })
    }

    pub fn scenario_names(&self) -> Vec<&str> {
        self.scenarios.iter().map(|s| s.name.as_str()).collect()
    }
}

/// Reject scenario configurations of an unsupported framework version.
///
/// Only the root element is inspected: its namespace must be [`SCENARIOS_NAMESPACE`] and its
/// `frameworkVersion` must start with [`SUPPORTED_MAJOR_VERSION`]. A document that is not
/// well-formed passes this check and fails later during schema validation with full
/// diagnostics.
pub fn check_framework_version(content: &[u8], location: &str) -> Result<(), ConfigurationError> {
    let mut reader = NsReader::from_reader(content);
    let mut buf = Vec::new();

    loop {
        match reader.read_resolved_event_into(&mut buf) {
            Ok((namespace, Event::Start(root))) | Ok((namespace, Event::Empty(root))) => {
                let in_namespace = matches!(
                    namespace,
                    ResolveResult::Bound(Namespace(uri)) if uri == SCENARIOS_NAMESPACE.as_bytes()
                );
                let version = root
                    .try_get_attribute("frameworkVersion")
                    .ok()
                    .flatten()
                    .map(|attr| String::from_utf8_lossy(&attr.value).into_owned());
                let supported = in_namespace
                    && version.is_some_and(|v| v.starts_with(SUPPORTED_MAJOR_VERSION));

                return if supported {
                    Ok(())
                } else {
                    Err(ConfigurationError::UnsupportedFramework {
                        location: location.to_string(),
                        supported: SCENARIOS_NAMESPACE,
                    })
                };
            }
            Ok((_, Event::Eof)) | Err(_) => return Ok(()),
            Ok(_) => {}
        }
        buf.clear();
    }
}
