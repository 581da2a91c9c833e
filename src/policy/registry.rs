//! Explicit policy engine registry
//!
//! Engines register a factory under a name; the manager looks the configured
//! name up once at construction. An unregistered name is fatal at startup.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use super::{PolicyEngine, SimplePolicyEngineFactory};
use crate::errors::StartupError;

pub trait PolicyEngineFactory: Send + Sync {
    fn name(&self) -> &'static str;

    /// Build an engine from its config section (an arbitrary JSON object
    /// owned by the engine)
    fn build(&self, conf: &Value) -> Result<Arc<dyn PolicyEngine>, StartupError>;
}

pub struct PolicyEngineRegistry {
    factories: RwLock<HashMap<String, Arc<dyn PolicyEngineFactory>>>,
}

impl PolicyEngineRegistry {
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// A registry pre-loaded with the built-in `simple` engine
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(SimplePolicyEngineFactory));
        registry
    }

    pub fn register(&self, factory: Arc<dyn PolicyEngineFactory>) {
        let name = factory.name().to_string();
        self.factories.write().insert(name, factory);
    }

    pub fn build(&self, name: &str, conf: &Value) -> Result<Arc<dyn PolicyEngine>, StartupError> {
        let factory = self
            .factories
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StartupError::PolicyEngineNotRegistered(name.to_string()))?;
        factory.build(conf)
    }
}

impl Default for PolicyEngineRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_registry_builds_simple() {
        let registry = PolicyEngineRegistry::with_defaults();
        assert!(registry.build("simple", &json!({})).is_ok());
    }

    #[test]
    fn test_unregistered_name_is_fatal() {
        let registry = PolicyEngineRegistry::with_defaults();
        let err = registry.build("bespoke", &json!({})).unwrap_err();
        assert!(matches!(err, StartupError::PolicyEngineNotRegistered(_)));
    }
}
