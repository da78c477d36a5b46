use std::collections::HashMap;
use std::sync::Arc;

use courier_core::SendError;
use serde_json::Value;

use crate::traits::{Adapter, AdapterMetadata};

type AdapterFactory = Arc<dyn Fn(Value) -> Result<Box<dyn Adapter>, SendError> + Send + Sync>;

struct AdapterEntry {
    metadata: AdapterMetadata,
    factory: AdapterFactory,
}

/// In-memory registry of adapter variants keyed by provider id.
///
/// The variant set is closed: providers register at startup via
/// [`crate::builtin_registry`], and lookups by unknown id fail fast with a
/// configuration error.
#[derive(Default)]
pub struct AdapterRegistry {
    entries: HashMap<String, AdapterEntry>,
}

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("adapter `{0}` already registered")]
    AlreadyRegistered(String),
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, metadata: AdapterMetadata, factory: F) -> Result<(), RegistryError>
    where
        F: Fn(Value) -> Result<Box<dyn Adapter>, SendError> + Send + Sync + 'static,
    {
        if self.entries.contains_key(metadata.id) {
            return Err(RegistryError::AlreadyRegistered(metadata.id.to_string()));
        }
        self.entries.insert(
            metadata.id.to_string(),
            AdapterEntry {
                metadata,
                factory: Arc::new(factory),
            },
        );
        Ok(())
    }

    /// Constructs an adapter instance for `id` from a raw configuration
    /// object. Construction never performs network I/O.
    pub fn create(&self, id: &str, config: Value) -> Result<Box<dyn Adapter>, SendError> {
        let entry = self
            .entries
            .get(id)
            .ok_or_else(|| SendError::Configuration(format!("unknown adapter `{id}`")))?;
        (entry.factory)(config)
    }

    pub fn metadata(&self, id: &str) -> Option<AdapterMetadata> {
        self.entries.get(id).map(|entry| entry.metadata)
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin_registry;
    use serde_json::json;

    #[test]
    fn unknown_adapter_is_a_configuration_error() {
        let registry = builtin_registry().unwrap();
        let err = registry.create("smoke-signals", json!({})).unwrap_err();
        assert!(!err.is_temporary());
        assert!(err.to_string().contains("smoke-signals"));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = builtin_registry().unwrap();
        let metadata = registry.metadata("webhook").unwrap();
        let result = registry.register(metadata, |_| {
            Err(SendError::Configuration("unused".into()))
        });
        assert!(matches!(result, Err(RegistryError::AlreadyRegistered(_))));
    }

    #[test]
    fn construction_is_pure_and_fails_fast_on_missing_fields() {
        let registry = builtin_registry().unwrap();
        // No network I/O happens here; missing required fields fail eagerly.
        let err = registry.create("resend", json!({})).unwrap_err();
        assert!(matches!(err, SendError::Configuration(_)));
    }
}
