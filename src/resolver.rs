use std::sync::Arc;

use tracing::warn;

use crate::content_repository::RepositoryLocation;
use crate::engine::{ArtifactResolver, ArtifactSource};
use crate::error::Result;

/// Resolves artifact references issued by the engine during compilation or transformation.
///
/// Each reference is resolved relative to the referencing artifact and then confined to the
/// repository; a reference that leaves it fails with an `OutsideRepository` error instead of
/// being loaded.
#[derive(Debug, Clone)]
pub struct ArtifactUriResolver {
    location: Arc<RepositoryLocation>,
}

impl ArtifactUriResolver {
    pub fn new(location: Arc<RepositoryLocation>) -> Self {
        Self { location }
    }

    pub fn location(&self) -> &RepositoryLocation {
        &self.location
    }
}

impl ArtifactResolver for ArtifactUriResolver {
    fn resolve(&self, href: &str, base: &str) -> Result<ArtifactSource> {
        let uri = self.location.resolve(base, href)?;
        self.location.load(&uri).inspect_err(|e| {
            warn!("Can not resolve '{}' from '{}': {}", href, base, e);
        })
    }

    fn load(&self, system_id: &str) -> Result<ArtifactSource> {
        let uri = self.location.interpret_system_id(system_id)?;
        self.location.load(&uri).inspect_err(|e| {
            warn!("Can not load '{}': {}", system_id, e);
        })
    }
}
