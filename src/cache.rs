use std::sync::Arc;

use moka::sync::Cache;

use crate::error::CompilationError;

/// In-memory cache for compiled artifacts (schemas, transforms)
///
/// Keys are canonical system identifiers. It uses `moka` to handle concurrent access and
/// "thundering herd" protection, ensuring an artifact is only compiled once even if several
/// scenarios or workers request it at the same time.
pub struct ArtifactCache<T> {
    cache: Cache<String, Arc<T>>,
}

impl<T: Send + Sync + 'static> ArtifactCache<T> {
    pub fn new(max_capacity: u64) -> Self {
        let cache = Cache::builder().max_capacity(max_capacity).build();

        Self { cache }
    }

    /// Get a compiled artifact from the cache, or compile it if missing.
    ///
    /// The `compile` closure only runs if the key is missing. Concurrent requests for the
    /// same key wait for the single leader to finish and share its result or its error.
    pub fn get_or_compile<F>(&self, key: String, compile: F) -> Result<Arc<T>, CompilationError>
    where
        F: FnOnce() -> Result<T, CompilationError>,
    {
        self.cache
            .try_get_with(key, || compile().map(Arc::new))
            .map_err(|e| (*e).clone())
    }

    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        self.cache.get(key)
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.run_pending_tasks();
        CacheStats {
            entries: self.cache.entry_count(),
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: u64,
}
