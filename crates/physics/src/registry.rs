use std::collections::BTreeMap;

use crate::articulated::{ARTICULATED, ArticulatedEngine};
use crate::engine::{EngineError, EngineParams, PhysicsEngine};
use crate::xpbd::{XPBD, XpbdEngine};

/// Constructor for a back-end.
pub type EngineFactory = fn(&EngineParams) -> Box<dyn PhysicsEngine>;

/// Name-to-factory table used to pick a physics back-end by string.
#[derive(Clone)]
pub struct EngineRegistry {
    factories: BTreeMap<String, EngineFactory>,
}

impl EngineRegistry {
    /// A registry with no back-ends.
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// A registry holding the back-ends shipped with this crate.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(XPBD, |p| Box::new(XpbdEngine::new(p)));
        registry.register(ARTICULATED, |p| Box::new(ArticulatedEngine::new(p)));
        registry
    }

    /// Add or replace a back-end.
    pub fn register(&mut self, name: impl Into<String>, factory: EngineFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Instantiate and initialize the back-end registered as `name`.
    pub fn create(&self, name: &str, params: &EngineParams) -> Result<Box<dyn PhysicsEngine>, EngineError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| EngineError::UnsupportedBackend(name.to_string()))?;
        let mut engine = factory(params);
        engine.init(params);
        tracing::debug!(backend = name, "created physics engine");
        Ok(engine)
    }
}

impl std::fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_backends_are_listed_in_order() {
        let registry = EngineRegistry::default();
        let names: Vec<&str> = registry.names().collect();
        assert_eq!(names, vec!["articulated", "xpbd"]);
    }

    #[test]
    fn create_by_name() {
        let registry = EngineRegistry::default();
        let engine = registry.create("xpbd", &EngineParams::default()).unwrap();
        assert_eq!(engine.kind(), "xpbd");
        assert_eq!(engine.body_count(), 0);
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let registry = EngineRegistry::default();
        let err = registry
            .create("bullet", &EngineParams::default())
            .err()
            .unwrap();
        assert_eq!(err, EngineError::UnsupportedBackend("bullet".into()));
        assert!(!EngineRegistry::empty().contains("xpbd"));
    }
}
