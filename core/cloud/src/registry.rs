//! Backend registry for resolving a cloud backend by name.

use serde_json::Value;
use std::collections::HashMap;

use cabinetry_common::{Error, Result};

use crate::api::CloudBackend;
use crate::memory::{MemoryCloud, MEMORY_PRINCIPAL_ID};

/// Factory function type for creating backends from JSON settings.
pub type BackendFactory = Box<dyn Fn(Value) -> Result<CloudBackend> + Send + Sync>;

/// Registry of backend factories.
///
/// Allows selecting a backend by the name given in configuration.
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl BackendRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a backend factory.
    ///
    /// # Errors
    /// - Returns error if name is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: BackendFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::InvalidInput(format!(
                "Backend '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Resolve a backend by name and settings.
    ///
    /// # Errors
    /// - Backend not registered
    /// - Settings invalid for the backend
    pub fn resolve(&self, name: &str, settings: Value) -> Result<CloudBackend> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Backend '{}' is not registered", name)))?;
        factory(settings)
    }

    /// Get list of registered backend names.
    pub fn backends(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Check if a backend is registered.
    pub fn has_backend(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn create_memory_backend(settings: Value) -> Result<CloudBackend> {
    let subscription = settings
        .get("subscription")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            Error::Configuration("memory backend requires a 'subscription'".to_string())
        })?;
    let principal = settings
        .get("principal")
        .and_then(|v| v.as_str())
        .unwrap_or(MEMORY_PRINCIPAL_ID);
    let lag = settings
        .get("authorization-lag")
        .and_then(|v| v.as_u64())
        .map(|v| v as u32);

    let cloud = MemoryCloud::new(subscription);
    let cloud = match lag {
        Some(lag) => cloud.with_rbac_enforcement(lag),
        None => cloud,
    };
    Ok(cloud.into_backend(principal))
}

/// Create a registry with the built-in backends ("memory" and "azure").
pub fn create_default_registry() -> Result<BackendRegistry> {
    let mut registry = BackendRegistry::new();
    registry.register("memory", Box::new(create_memory_backend))?;
    registry.register("azure", Box::new(crate::azure::create_azure_backend))?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn memory_factory() -> BackendFactory {
        Box::new(|_| Ok(MemoryCloud::new("sub").into_backend(MEMORY_PRINCIPAL_ID)))
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = BackendRegistry::new();
        registry.register("test", memory_factory()).unwrap();

        let backend = registry.resolve("test", Value::Null).unwrap();
        assert_eq!(backend.name, "memory");
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = BackendRegistry::new();
        registry.register("test", memory_factory()).unwrap();

        let result = registry.register("test", memory_factory());
        assert!(result.is_err());
    }

    #[test]
    fn test_resolve_unknown_fails() {
        let registry = BackendRegistry::new();
        let result = registry.resolve("unknown", Value::Null);
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_default_registry_backends() {
        let registry = create_default_registry().unwrap();
        assert!(registry.has_backend("memory"));
        assert!(registry.has_backend("azure"));
        assert_eq!(registry.backends().len(), 2);
    }

    #[test]
    fn test_memory_backend_requires_subscription() {
        let registry = create_default_registry().unwrap();
        assert!(matches!(
            registry.resolve("memory", json!({})),
            Err(Error::Configuration(_))
        ));

        let backend = registry
            .resolve("memory", json!({ "subscription": "sub" }))
            .unwrap();
        assert_eq!(backend.name, "memory");
    }
}
