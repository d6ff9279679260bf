//! Evaluation requests, outputs and the opaque algorithm state.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Identifies one evaluation request within the current round.
pub type EvaluationIndex = u64;

/// A named bundle of values. Nested objects act as namespaces.
pub type Bundle = serde_json::Map<String, Value>;

/// A batch keyed by evaluation index, always iterated in index order.
pub type Batch<T> = BTreeMap<EvaluationIndex, T>;

/// Input parameters for one evaluation, produced by an engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EvaluationRequest {
    pub inputs: Bundle,
}

impl EvaluationRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.inputs.get(key)
    }
}

impl From<Bundle> for EvaluationRequest {
    fn from(inputs: Bundle) -> Self {
        Self { inputs }
    }
}

/// Result values returned by one completed evaluation task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EvaluationOutput {
    pub outputs: Bundle,
}

impl EvaluationOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.outputs.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.outputs.get(key)
    }

    /// Numeric value stored under `key`, if present and numeric.
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.outputs.get(key).and_then(Value::as_f64)
    }
}

impl From<Bundle> for EvaluationOutput {
    fn from(outputs: Bundle) -> Self {
        Self { outputs }
    }
}

/// Serialized snapshot of an engine's progress.
///
/// The payload is opaque to everything except the engine named in `engine`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmState {
    pub engine: String,
    pub payload: Value,
}

impl AlgorithmState {
    pub fn new(engine: impl Into<String>, payload: Value) -> Self {
        Self {
            engine: engine.into(),
            payload,
        }
    }
}

/// Terminal value of an optimization, plus the evaluation that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalResult {
    pub value: Value,
    pub index: Option<EvaluationIndex>,
}

impl FinalResult {
    pub fn new(value: impl Into<Value>, index: Option<EvaluationIndex>) -> Self {
        Self {
            value: value.into(),
            index,
        }
    }
}
