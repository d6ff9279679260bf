//! # rd-engine
//!
//! The engine contract for Rondo and the engines that ship with it.
//!
//! An [`Engine`] builds and rehydrates [`rd_types::AlgorithmState`]; a
//! [`Session`] over that state produces batches of evaluation requests and
//! ingests their outputs. Algorithms implement the typed [`Algorithm`] trait
//! and are lifted into engines by [`AlgorithmEngine`], which also enforces
//! exactly-once accounting of every requested index.

mod bisection;
mod engine;
mod registry;
mod search;
mod space;

pub use bisection::{Bisection, BisectionConfig};
pub use engine::{Algorithm, AlgorithmEngine, Engine, Session};
pub use registry::EngineRegistry;
pub use search::{
    AdaptiveConfig, AdaptiveSearch, GridConfig, GridSearch, RandomConfig, RandomSearch,
};
pub use space::{
    BestTracker, Observation, ObjectiveDirection, ParameterDef, ParameterKind, ParameterValue,
    Parameters, SearchSpace,
};
