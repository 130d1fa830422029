//! Persistence provider registry
//!
//! Providers are resolved by name through an explicit registry populated at
//! process startup. No dynamic loading: every provider is a factory function
//! compiled into the binary.

use cloudgossip_store::persist::{MemoryBackend, PersistenceBackend, SledBackend};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::error::ServerError;

type ProviderFactory =
    Box<dyn Fn(&Path) -> Result<Arc<dyn PersistenceBackend>, ServerError> + Send + Sync>;

pub struct ProviderRegistry {
    factories: HashMap<&'static str, ProviderFactory>,
}

impl ProviderRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// The built-in providers: `memory` (volatile) and `sled` (durable,
    /// rooted at the data directory).
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("memory", Box::new(|_| Ok(Arc::new(MemoryBackend::new()))));
        registry.register(
            "sled",
            Box::new(|data_dir| {
                let path: PathBuf = data_dir.join("store");
                Ok(Arc::new(SledBackend::open(path)?))
            }),
        );
        registry
    }

    pub fn register(&mut self, name: &'static str, factory: ProviderFactory) {
        self.factories.insert(name, factory);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    pub fn resolve(
        &self,
        name: &str,
        data_dir: &Path,
    ) -> Result<Arc<dyn PersistenceBackend>, ServerError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| ServerError::UnknownProvider(name.to_string()))?;
        debug!(provider = name, "resolving persistence provider");
        factory(data_dir)
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use cloudgossip_core::{EntryMetadata, StoreEntry};
    use tempfile::tempdir;

    #[test]
    fn default_registry_resolves_builtin_providers() {
        let registry = ProviderRegistry::with_defaults();
        let dir = tempdir().unwrap();

        for name in ["memory", "sled"] {
            let backend = registry.resolve(name, dir.path()).unwrap();
            let content = Bytes::from_static(b"v");
            let entry = StoreEntry::new(
                "k",
                EntryMetadata::for_content(&content, "", Default::default()),
                content,
            );
            backend.write(&entry).unwrap();
            assert!(backend.contains("k").unwrap(), "provider {name}");
        }
    }

    #[test]
    fn unknown_provider_is_an_error() {
        let registry = ProviderRegistry::with_defaults();
        let dir = tempdir().unwrap();
        assert!(matches!(
            registry.resolve("reflection", dir.path()),
            Err(ServerError::UnknownProvider(_))
        ));
    }

    #[test]
    fn custom_provider_registration() {
        let mut registry = ProviderRegistry::empty();
        registry.register("volatile", Box::new(|_| Ok(Arc::new(MemoryBackend::new()))));
        let dir = tempdir().unwrap();
        assert!(registry.resolve("volatile", dir.path()).is_ok());
        assert!(registry.resolve("memory", dir.path()).is_err());
    }
}
