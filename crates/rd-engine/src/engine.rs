//! The engine contract and the adapter that lifts a typed [`Algorithm`] into it.
//!
//! The controller only ever sees [`Engine`] and [`Session`]. Algorithms are
//! written against [`Algorithm`], a plain serde-serializable state machine, and
//! [`AlgorithmEngine`] enforces the contract for them: outstanding indices are
//! recorded inside the persisted state, `update` must receive exactly the last
//! requested batch, and `result` is refused until the algorithm is finished.

use rd_types::{
    AlgorithmState, Batch, ConfigError, ContractViolation, EvaluationIndex, EvaluationOutput,
    EvaluationRequest, FinalResult, OptResult, StoreError,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::marker::PhantomData;
use tracing::debug;

/// Capability set every optimization method provides.
pub trait Engine: Send + Sync {
    /// Name the engine is registered under; stamped into every state it builds.
    fn name(&self) -> &str;

    /// Build the initial state from algorithm-specific configuration.
    fn construct(&self, config: &serde_json::Value) -> OptResult<AlgorithmState>;

    /// Rehydrate a working session from persisted state. No side effects.
    fn resume(&self, state: &AlgorithmState) -> OptResult<Box<dyn Session>>;
}

/// A live view over one [`AlgorithmState`].
pub trait Session: Send {
    fn is_finished(&self) -> bool;

    /// Produce the next batch. Indices are unique within the batch.
    fn create_inputs(&mut self) -> OptResult<Batch<EvaluationRequest>>;

    /// Consume the outputs of the most recent batch and return the new state.
    fn update(&mut self, outputs: Batch<EvaluationOutput>) -> OptResult<AlgorithmState>;

    /// Serialize the current state.
    fn state(&self) -> OptResult<AlgorithmState>;

    /// Terminal result; only valid once [`Session::is_finished`] is true.
    fn result(&self) -> OptResult<FinalResult>;

    /// Indices requested by the last `create_inputs` and not yet updated.
    fn outstanding(&self) -> Vec<EvaluationIndex>;
}

/// A typed optimization algorithm whose whole progress is its own value.
pub trait Algorithm: Serialize + DeserializeOwned + Send + 'static {
    /// Registry name.
    const NAME: &'static str;

    /// Algorithm-specific hyperparameters.
    type Config: DeserializeOwned;

    fn from_config(config: Self::Config) -> OptResult<Self>;

    fn is_finished(&self) -> bool;

    fn create_inputs(&mut self) -> OptResult<Batch<EvaluationRequest>>;

    fn update(&mut self, outputs: Batch<EvaluationOutput>) -> OptResult<()>;

    fn result(&self) -> OptResult<FinalResult>;
}

/// What actually gets persisted for an [`Algorithm`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Envelope<A> {
    pending: BTreeSet<EvaluationIndex>,
    algorithm: A,
}

/// [`Engine`] implementation for any [`Algorithm`].
pub struct AlgorithmEngine<A> {
    _marker: PhantomData<fn() -> A>,
}

impl<A: Algorithm> AlgorithmEngine<A> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<A: Algorithm> Default for AlgorithmEngine<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Algorithm> Engine for AlgorithmEngine<A> {
    fn name(&self) -> &str {
        A::NAME
    }

    fn construct(&self, config: &serde_json::Value) -> OptResult<AlgorithmState> {
        let config: A::Config = serde_json::from_value(config.clone()).map_err(|e| {
            ConfigError::InvalidEngineConfig {
                engine: A::NAME.to_string(),
                message: e.to_string(),
            }
        })?;
        let envelope = Envelope {
            pending: BTreeSet::new(),
            algorithm: A::from_config(config)?,
        };
        debug!(engine = A::NAME, "constructed initial algorithm state");
        encode(&envelope)
    }

    fn resume(&self, state: &AlgorithmState) -> OptResult<Box<dyn Session>> {
        if state.engine != A::NAME {
            return Err(ContractViolation::EngineMismatch {
                expected: A::NAME.to_string(),
                actual: state.engine.clone(),
            }
            .into());
        }

        let envelope: Envelope<A> =
            serde_json::from_value(state.payload.clone()).map_err(|e| StoreError::Corrupted {
                key: format!("{} state", A::NAME),
                message: e.to_string(),
            })?;

        // Rehydration must not lose or invent anything.
        if serde_json::to_value(&envelope)? != state.payload {
            return Err(ContractViolation::NonDeterministicResume {
                engine: A::NAME.to_string(),
            }
            .into());
        }

        Ok(Box::new(AlgorithmSession { envelope }))
    }
}

fn encode<A: Algorithm>(envelope: &Envelope<A>) -> OptResult<AlgorithmState> {
    Ok(AlgorithmState::new(A::NAME, serde_json::to_value(envelope)?))
}

struct AlgorithmSession<A> {
    envelope: Envelope<A>,
}

impl<A: Algorithm> Session for AlgorithmSession<A> {
    fn is_finished(&self) -> bool {
        self.envelope.pending.is_empty() && self.envelope.algorithm.is_finished()
    }

    fn create_inputs(&mut self) -> OptResult<Batch<EvaluationRequest>> {
        if !self.envelope.pending.is_empty() {
            return Err(ContractViolation::BatchOutstanding {
                outstanding: self.envelope.pending.len(),
            }
            .into());
        }

        let batch = self.envelope.algorithm.create_inputs()?;
        if batch.is_empty() {
            return Err(ContractViolation::EmptyBatch.into());
        }

        self.envelope.pending = batch.keys().copied().collect();
        Ok(batch)
    }

    fn update(&mut self, outputs: Batch<EvaluationOutput>) -> OptResult<AlgorithmState> {
        let received: BTreeSet<EvaluationIndex> = outputs.keys().copied().collect();
        if received != self.envelope.pending {
            return Err(ContractViolation::IndexMismatch {
                expected: self.envelope.pending.iter().copied().collect(),
                actual: received.into_iter().collect(),
            }
            .into());
        }

        self.envelope.algorithm.update(outputs)?;
        self.envelope.pending.clear();
        encode(&self.envelope)
    }

    fn state(&self) -> OptResult<AlgorithmState> {
        encode(&self.envelope)
    }

    fn result(&self) -> OptResult<FinalResult> {
        if !self.is_finished() {
            return Err(ContractViolation::NotFinished.into());
        }
        self.envelope.algorithm.result()
    }

    fn outstanding(&self) -> Vec<EvaluationIndex> {
        self.envelope.pending.iter().copied().collect()
    }
}
