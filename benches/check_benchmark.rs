use std::sync::Arc;

use divan::Bencher;
use scenario_validator::content_repository::{ContentRepository, RepositoryLocation};
use scenario_validator::engine::{ArtifactSource, Engine, NamespaceBindings, ParseOutcome};
use scenario_validator::filesystem::ArtifactUri;
use scenario_validator::libxml2::{LibXml2Engine, XmlDocument};
use tempfile::TempDir;

fn main() {
    divan::main();
}

const INVOICE_XSD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema"
           targetNamespace="urn:example:invoice"
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

const VALID_INVOICE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Invoice xmlns="urn:example:invoice"><ID>42</ID><Amount>10.00</Amount></Invoice>"#;

const INVALID_INVOICE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Invoice xmlns="urn:example:invoice"><Amount>ten</Amount></Invoice>"#;

struct Fixture {
    _dir: TempDir,
    repository: ContentRepository<LibXml2Engine>,
    schema: ArtifactUri,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("invoice.xsd"), INVOICE_XSD).unwrap();
    let location = RepositoryLocation::new(ArtifactUri::file(dir.path())).unwrap();
    let schema = ArtifactUri::file(dir.path().join("invoice.xsd"));
    Fixture {
        _dir: dir,
        repository: ContentRepository::new(Arc::new(LibXml2Engine::new()), location),
        schema,
    }
}

fn parse(engine: &LibXml2Engine, xml: &str) -> XmlDocument {
    match engine.parse_document(xml.as_bytes(), "invoice.xml").unwrap() {
        ParseOutcome::Parsed(document) => document,
        ParseOutcome::Malformed(errors) => panic!("Malformed benchmark input: {:?}", errors),
    }
}

#[divan::bench]
fn parse_document(bencher: Bencher) {
    let engine = LibXml2Engine::new();
    bencher.bench_local(|| engine.parse_document(VALID_INVOICE.as_bytes(), "invoice.xml"));
}

#[divan::bench]
fn compile_schema(bencher: Bencher) {
    let fixture = fixture();
    let source = ArtifactSource::new(fixture.schema.system_id(), INVOICE_XSD.as_bytes());
    let engine = fixture.repository.engine();
    let resolver = fixture.repository.resolver();

    bencher.bench_local(|| engine.compile_schema(std::slice::from_ref(&source), resolver).unwrap());
}

#[divan::bench]
fn load_cached_schema(bencher: Bencher) {
    let fixture = fixture();
    let locations = [fixture.schema.clone()];
    fixture.repository.load_schema(&locations).unwrap();

    bencher.bench_local(|| fixture.repository.load_schema(&locations).unwrap());
}

#[divan::bench(args = [true, false])]
fn validate(bencher: Bencher, valid: bool) {
    let fixture = fixture();
    let engine = fixture.repository.engine();
    let schema = fixture
        .repository
        .load_schema(std::slice::from_ref(&fixture.schema))
        .unwrap();
    let document = parse(engine, if valid { VALID_INVOICE } else { INVALID_INVOICE });

    bencher.bench_local(|| engine.validate(&schema, &document).unwrap());
}

#[divan::bench]
fn match_scenario(bencher: Bencher) {
    let engine = LibXml2Engine::new();
    let mut namespaces = NamespaceBindings::new();
    namespaces.insert("inv".to_string(), "urn:example:invoice".to_string());
    let predicate = engine.compile_predicate("/inv:Invoice", &namespaces).unwrap();
    let document = parse(&engine, VALID_INVOICE);

    bencher.bench_local(|| engine.evaluate_predicate(&predicate, &document).unwrap());
}
