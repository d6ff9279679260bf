//! Explicit selection of engine implementations.

use rd_types::{ConfigError, OptResult};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::bisection::Bisection;
use crate::engine::{Algorithm, AlgorithmEngine, Engine};
use crate::search::{AdaptiveSearch, GridSearch, RandomSearch};

/// Engines available to a run, keyed by their registered name.
#[derive(Clone, Default)]
pub struct EngineRegistry {
    engines: BTreeMap<String, Arc<dyn Engine>>,
}

impl EngineRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every engine shipped with this crate.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_algorithm::<Bisection>();
        registry.register_algorithm::<GridSearch>();
        registry.register_algorithm::<RandomSearch>();
        registry.register_algorithm::<AdaptiveSearch>();
        registry
    }

    /// Register an engine under its own name, replacing any previous entry.
    pub fn register(&mut self, engine: Arc<dyn Engine>) -> &mut Self {
        self.engines.insert(engine.name().to_string(), engine);
        self
    }

    pub fn register_algorithm<A: Algorithm>(&mut self) -> &mut Self {
        self.register(Arc::new(AlgorithmEngine::<A>::new()))
    }

    pub fn get(&self, name: &str) -> OptResult<Arc<dyn Engine>> {
        self.engines.get(name).cloned().ok_or_else(|| {
            ConfigError::UnknownEngine {
                name: name.to_string(),
            }
            .into()
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.engines.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRegistry")
            .field("engines", &self.engines.keys().collect::<Vec<_>>())
            .finish()
    }
}
