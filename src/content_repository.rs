//! Repository of validation artifacts.
//!
//! All schemas, rule transforms and report transforms of a scenario configuration live below
//! a single repository root, which is either a directory or a location inside an archive.
//! Every artifact reference, including nested ones followed by the engine, is resolved here
//! and rejected when it leaves the repository.

use std::sync::Arc;

use tracing::{debug, info};

use crate::cache::ArtifactCache;
use crate::engine::{ArtifactSource, Engine, NamespaceBindings, SharedResolver};
use crate::error::{ConfigurationError, Result};
use crate::filesystem::ArtifactUri;
use crate::resolver::ArtifactUriResolver;

/// Default number of compiled schemas and transforms kept per repository
pub const DEFAULT_ARTIFACT_CACHE_ENTRIES: u64 = 256;

/// Root of a repository plus the container it lives in, if any
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryLocation {
    root: ArtifactUri,
    container_reference: Option<String>,
}

impl RepositoryLocation {
    /// Create a location rooted at `root`, which must denote a directory
    /// (or a directory-like location inside a container).
    pub fn new(root: ArtifactUri) -> Result<Self> {
        let root = match root {
            ArtifactUri::File(path) if path.is_file() => {
                // A file given as root means its directory
                ArtifactUri::File(path.parent().map(|p| p.to_path_buf()).unwrap_or(path))
            }
            ArtifactUri::File(path) if !path.is_dir() => {
                return Err(ConfigurationError::ArtifactNotFound {
                    artifact: path.display().to_string(),
                }
                .into());
            }
            other => other,
        };

        let container_reference = root
            .container_path()
            .map(|container| container.display().to_string());

        Ok(Self {
            root,
            container_reference,
        })
    }

    pub fn root(&self) -> &ArtifactUri {
        &self.root
    }

    /// The container the repository lives in, when it is archive-backed
    pub fn container_reference(&self) -> Option<&str> {
        self.container_reference.as_deref()
    }

    /// Resolve `href` relative to the artifact identified by `base`.
    ///
    /// An empty base means the repository root. When the base lies inside a container the
    /// result stays inside that container: relative references resolve against the base's
    /// directory, absolute ones against the container root.
    pub fn resolve(&self, base: &str, href: &str) -> Result<ArtifactUri> {
        let directory = if base.trim().is_empty() {
            self.root.clone()
        } else {
            let base = ArtifactUri::parse(base)?;
            base.parent().unwrap_or(base)
        };
        Ok(directory.join(href)?)
    }

    /// Resolve a location given relative to the repository root and check the boundary
    pub fn resolve_artifact(&self, location: &str) -> Result<ArtifactUri> {
        let resolved = self.root.join(location)?;
        self.check_boundary(&resolved)?;
        Ok(resolved)
    }

    /// Whether `uri` lies within this repository
    pub fn is_under_boundary(&self, uri: &ArtifactUri) -> bool {
        uri.is_within(&self.root)
    }

    /// Canonical identifier of `uri`, prefixed with the container reference when archive-backed
    pub fn system_identifier(&self, uri: &ArtifactUri) -> String {
        uri.system_id()
    }

    /// Interpret a system identifier handed back by an engine.
    ///
    /// Engines merge nested references into plain paths. In an archive-backed repository
    /// nothing can live outside the container, so a plain absolute path is read as an
    /// absolute entry of the repository's container.
    pub fn interpret_system_id(&self, system_id: &str) -> Result<ArtifactUri> {
        let uri = ArtifactUri::parse(system_id)?;
        match (&uri, self.root.container_path()) {
            (ArtifactUri::File(path), Some(container)) if path.as_path() != container => {
                Ok(ArtifactUri::container_entry(
                    container,
                    &path.to_string_lossy(),
                ))
            }
            _ => Ok(uri),
        }
    }

    pub fn check_boundary(&self, uri: &ArtifactUri) -> Result<()> {
        if self.is_under_boundary(uri) {
            Ok(())
        } else {
            Err(ConfigurationError::OutsideRepository {
                artifact: uri.system_id(),
                repository: self.root.system_id(),
            }
            .into())
        }
    }

    /// Load an artifact after checking that it lies within the repository
    pub fn load(&self, uri: &ArtifactUri) -> Result<ArtifactSource> {
        self.check_boundary(uri)?;
        let content = uri.read()?;
        debug!("Loaded {} ({} bytes)", uri, content.len());
        Ok(ArtifactSource::new(self.system_identifier(uri), content))
    }
}

/// Loads and compiles repository artifacts through an [`Engine`]
pub struct ContentRepository<E: Engine> {
    engine: Arc<E>,
    location: Arc<RepositoryLocation>,
    resolver: SharedResolver,
    schemas: ArtifactCache<E::Schema>,
    transforms: ArtifactCache<E::Transform>,
}

impl<E: Engine> ContentRepository<E> {
    pub fn new(engine: Arc<E>, location: RepositoryLocation) -> Self {
        Self::with_cache_capacity(engine, location, DEFAULT_ARTIFACT_CACHE_ENTRIES)
    }

    pub fn with_cache_capacity(
        engine: Arc<E>,
        location: RepositoryLocation,
        cache_entries: u64,
    ) -> Self {
        let location = Arc::new(location);
        let resolver: SharedResolver = Arc::new(ArtifactUriResolver::new(Arc::clone(&location)));
        Self {
            engine,
            location,
            resolver,
            schemas: ArtifactCache::new(cache_entries),
            transforms: ArtifactCache::new(cache_entries),
        }
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    pub fn location(&self) -> &RepositoryLocation {
        &self.location
    }

    /// Resolver to hand to the engine for nested artifact references
    pub fn resolver(&self) -> &SharedResolver {
        &self.resolver
    }

    pub fn resolve(&self, base: &str, href: &str) -> Result<ArtifactUri> {
        self.location.resolve(base, href)
    }

    pub fn resolve_artifact(&self, location: &str) -> Result<ArtifactUri> {
        self.location.resolve_artifact(location)
    }

    pub fn is_under_boundary(&self, uri: &ArtifactUri) -> bool {
        self.location.is_under_boundary(uri)
    }

    pub fn system_identifier(&self, uri: &ArtifactUri) -> String {
        self.location.system_identifier(uri)
    }

    /// Compile a schema made of one or more sources, once per distinct source set
    pub fn load_schema(&self, locations: &[ArtifactUri]) -> Result<Arc<E::Schema>> {
        let key = locations
            .iter()
            .map(ArtifactUri::system_id)
            .collect::<Vec<_>>()
            .join("|");
        if let Some(schema) = self.schemas.get(&key) {
            return Ok(schema);
        }

        let sources = locations
            .iter()
            .map(|uri| self.location.load(uri))
            .collect::<Result<Vec<_>>>()?;
        info!("Loading schema from {}", key);

        let schema = self.schemas.get_or_compile(key, || {
            self.engine.compile_schema(&sources, &self.resolver)
        })?;
        Ok(schema)
    }

    /// Compile a transform, once per system identifier
    pub fn load_transform(&self, location: &ArtifactUri) -> Result<Arc<E::Transform>> {
        let key = location.system_id();
        if let Some(transform) = self.transforms.get(&key) {
            return Ok(transform);
        }

        let source = self.location.load(location)?;
        info!("Loading transform from {}", key);

        let transform = self.transforms.get_or_compile(key, || {
            self.engine.compile_transform(&source, &self.resolver)
        })?;
        Ok(transform)
    }

    /// Compile a predicate. Predicates are owned by their scenario and not cached here.
    pub fn compile_predicate(
        &self,
        expression: &str,
        namespaces: &NamespaceBindings,
    ) -> Result<E::Predicate> {
        Ok(self.engine.compile_predicate(expression, namespaces)?)
    }

    /// Compile a schema shipped with the application rather than read from the repository
    pub fn compile_builtin_schema(&self, source: &ArtifactSource) -> Result<E::Schema> {
        Ok(self
            .engine
            .compile_schema(std::slice::from_ref(source), &self.resolver)?)
    }

    /// Number of compiled schemas and transforms currently cached
    pub fn cached_artifacts(&self) -> u64 {
        self.schemas.stats().entries + self.transforms.stats().entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CheckError;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn repository() -> (TempDir, RepositoryLocation) {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir_all(temp_dir.path().join("xsd")).unwrap();
        std::fs::write(temp_dir.path().join("xsd/invoice.xsd"), "<xs:schema/>").unwrap();
        std::fs::write(temp_dir.path().join("outside.xsd"), "<xs:schema/>").unwrap();
        let root = temp_dir.path().join("xsd");
        let location = RepositoryLocation::new(ArtifactUri::file(&root)).unwrap();
        (temp_dir, location)
    }

    #[test]
    fn test_file_root_means_its_directory() {
        let (temp_dir, _) = repository();
        let location =
            RepositoryLocation::new(ArtifactUri::file(temp_dir.path().join("xsd/invoice.xsd")))
                .unwrap();
        assert_eq!(location.root(), &ArtifactUri::file(temp_dir.path().join("xsd")));
        assert_eq!(location.container_reference(), None);
    }

    #[test]
    fn test_missing_root_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let result = RepositoryLocation::new(ArtifactUri::file(temp_dir.path().join("nope")));
        assert!(matches!(
            result,
            Err(CheckError::Configuration(
                ConfigurationError::ArtifactNotFound { .. }
            ))
        ));
    }

    #[test]
    fn test_resolve_relative_to_base_document() {
        let (temp_dir, location) = repository();
        let base = temp_dir.path().join("xsd/invoice.xsd");

        let resolved = location
            .resolve(&base.display().to_string(), "common/types.xsd")
            .unwrap();
        assert_eq!(
            resolved,
            ArtifactUri::file(temp_dir.path().join("xsd/common/types.xsd"))
        );
    }

    #[test]
    fn test_resolve_with_empty_base_uses_root() {
        let (temp_dir, location) = repository();
        assert_eq!(
            location.resolve("", "invoice.xsd").unwrap(),
            ArtifactUri::file(temp_dir.path().join("xsd/invoice.xsd"))
        );
    }

    #[test]
    fn test_resolve_inside_container() {
        let location =
            RepositoryLocation::new(ArtifactUri::container_entry("/srv/repo.zip", "/")).unwrap();
        assert_eq!(location.container_reference(), Some("/srv/repo.zip"));

        let relative = location
            .resolve("/srv/repo.zip!/xsd/invoice.xsd", "types.xsd")
            .unwrap();
        assert_eq!(
            relative,
            ArtifactUri::container_entry("/srv/repo.zip", "/xsd/types.xsd")
        );

        let absolute = location
            .resolve("/srv/repo.zip!/xsd/invoice.xsd", "/rules/a.xsl")
            .unwrap();
        assert_eq!(
            absolute,
            ArtifactUri::container_entry("/srv/repo.zip", "/rules/a.xsl")
        );
    }

    #[test]
    fn test_boundary_rejects_escape() {
        let (_temp_dir, location) = repository();

        let escaped = location.resolve_artifact("../outside.xsd");
        match escaped {
            Err(CheckError::Configuration(ConfigurationError::OutsideRepository {
                artifact,
                ..
            })) => assert!(artifact.ends_with("outside.xsd")),
            other => panic!("Expected OutsideRepository, got {:?}", other),
        }

        assert!(location.resolve_artifact("invoice.xsd").is_ok());
    }

    #[test]
    fn test_boundary_rejects_absolute_outside_path() {
        let (_temp_dir, location) = repository();
        assert!(!location.is_under_boundary(&ArtifactUri::File(PathBuf::from("/etc/passwd"))));
    }

    #[test]
    fn test_boundary_inside_container_subdirectory() {
        let location =
            RepositoryLocation::new(ArtifactUri::container_entry("/srv/repo.zip", "/content"))
                .unwrap();
        assert!(location.resolve_artifact("xsd/a.xsd").is_ok());
        assert!(location.resolve_artifact("../other/a.xsd").is_err());
        assert!(location.resolve_artifact("/other/a.xsd").is_err());
    }

    #[test]
    fn test_interpret_plain_path_in_container_repository() {
        let location =
            RepositoryLocation::new(ArtifactUri::container_entry("/srv/repo.zip", "/")).unwrap();
        assert_eq!(
            location.interpret_system_id("/xsd/types.xsd").unwrap(),
            ArtifactUri::container_entry("/srv/repo.zip", "/xsd/types.xsd")
        );
        assert_eq!(
            location
                .interpret_system_id("/srv/repo.zip!/xsd/types.xsd")
                .unwrap(),
            ArtifactUri::container_entry("/srv/repo.zip", "/xsd/types.xsd")
        );
    }

    #[test]
    fn test_load_checks_boundary_before_reading() {
        let (temp_dir, location) = repository();

        let inside = location
            .load(&ArtifactUri::file(temp_dir.path().join("xsd/invoice.xsd")))
            .unwrap();
        assert_eq!(&*inside.content, b"<xs:schema/>");
        assert!(inside.system_id.ends_with("invoice.xsd"));

        let outside = location.load(&ArtifactUri::file(temp_dir.path().join("outside.xsd")));
        assert!(matches!(
            outside,
            Err(CheckError::Configuration(
                ConfigurationError::OutsideRepository { .. }
            ))
        ));
    }
}
