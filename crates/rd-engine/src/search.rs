//! Sampling engines over a [`SearchSpace`]: grid, random and adaptive.
//!
//! All three keep the parameters of every outstanding index in their state,
//! record objectives into a [`BestTracker`], and name the best evaluation as
//! the winning index. Random draws are derived from `(seed, index)` so a
//! resumed engine produces exactly the batch an uninterrupted one would have.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rd_types::{
    Batch, EvaluationIndex, EvaluationOutput, EvaluationRequest, FinalResult, OptResult,
};
use serde::{Deserialize, Serialize};

use crate::engine::Algorithm;
use crate::space::{BestTracker, ObjectiveDirection, Parameters, SearchSpace};

fn default_batch_size() -> usize {
    8
}

fn default_float_steps() -> usize {
    5
}

fn default_objective_key() -> String {
    "result".to_string()
}

fn default_exploration_weight() -> f64 {
    0.3
}

fn default_perturbation() -> f64 {
    0.1
}

fn request_for(parameters: &Parameters) -> EvaluationRequest {
    parameters
        .iter()
        .fold(EvaluationRequest::new(), |req, (name, value)| {
            req.with(name.clone(), value.clone())
        })
}

fn rng_for(seed: u64, index: EvaluationIndex) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed ^ index.wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

/// Move outstanding parameters into the tracker.
fn record_batch(
    tracker: &mut BestTracker,
    in_flight: &mut Batch<Parameters>,
    outputs: &Batch<EvaluationOutput>,
) -> OptResult<()> {
    for (index, output) in outputs {
        let parameters = in_flight
            .remove(index)
            .ok_or_else(|| rd_types::internal_error!("no parameters recorded for index {index}"))?;
        tracker.record(*index, parameters, output)?;
    }
    Ok(())
}

fn check_batch_size(engine: &str, batch_size: usize) -> OptResult<()> {
    if batch_size == 0 {
        return Err(rd_types::config_error!(engine, "batch_size must be at least 1"));
    }
    Ok(())
}

// ---- Grid search ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GridConfig {
    pub space: SearchSpace,
    /// Number of steps for continuous dimensions.
    #[serde(default = "default_float_steps")]
    pub float_steps: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_objective_key")]
    pub objective_key: String,
    #[serde(default)]
    pub direction: ObjectiveDirection,
}

/// Exhaustive grid search, `batch_size` points per round.
///
/// The index of a point is its position in the grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSearch {
    space: SearchSpace,
    float_steps: usize,
    batch_size: usize,
    total: usize,
    cursor: usize,
    in_flight: Batch<Parameters>,
    tracker: BestTracker,
}

impl Algorithm for GridSearch {
    const NAME: &'static str = "grid";
    type Config = GridConfig;

    fn from_config(config: GridConfig) -> OptResult<Self> {
        config.space.validate(Self::NAME)?;
        check_batch_size(Self::NAME, config.batch_size)?;
        let total = config.space.grid_size(config.float_steps).ok_or_else(|| {
            rd_types::config_error!(Self::NAME, "grid has more points than can be counted")
        })?;

        Ok(Self {
            space: config.space,
            float_steps: config.float_steps,
            batch_size: config.batch_size,
            total,
            cursor: 0,
            in_flight: Batch::new(),
            tracker: BestTracker::new(config.direction, config.objective_key),
        })
    }

    fn is_finished(&self) -> bool {
        self.cursor >= self.total && self.in_flight.is_empty()
    }

    fn create_inputs(&mut self) -> OptResult<Batch<EvaluationRequest>> {
        let end = self.cursor.saturating_add(self.batch_size).min(self.total);

        let mut batch = Batch::new();
        for position in self.cursor..end {
            let parameters = self
                .space
                .grid_point(self.float_steps, position)
                .ok_or_else(|| rd_types::internal_error!("grid position {position} out of range"))?;
            let index = position as EvaluationIndex;
            batch.insert(index, request_for(&parameters));
            self.in_flight.insert(index, parameters);
        }
        self.cursor = end;
        Ok(batch)
    }

    fn update(&mut self, outputs: Batch<EvaluationOutput>) -> OptResult<()> {
        record_batch(&mut self.tracker, &mut self.in_flight, &outputs)
    }

    fn result(&self) -> OptResult<FinalResult> {
        Ok(self.tracker.result())
    }
}

// ---- Random search ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RandomConfig {
    pub space: SearchSpace,
    pub max_evaluations: usize,
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_objective_key")]
    pub objective_key: String,
    #[serde(default)]
    pub direction: ObjectiveDirection,
}

/// Independent seeded sampling across the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomSearch {
    space: SearchSpace,
    seed: u64,
    max_evaluations: usize,
    batch_size: usize,
    issued: usize,
    in_flight: Batch<Parameters>,
    tracker: BestTracker,
}

impl Algorithm for RandomSearch {
    const NAME: &'static str = "random";
    type Config = RandomConfig;

    fn from_config(config: RandomConfig) -> OptResult<Self> {
        config.space.validate(Self::NAME)?;
        check_batch_size(Self::NAME, config.batch_size)?;

        Ok(Self {
            space: config.space,
            seed: config.seed,
            max_evaluations: config.max_evaluations,
            batch_size: config.batch_size,
            issued: 0,
            in_flight: Batch::new(),
            tracker: BestTracker::new(config.direction, config.objective_key),
        })
    }

    fn is_finished(&self) -> bool {
        self.issued >= self.max_evaluations && self.in_flight.is_empty()
    }

    fn create_inputs(&mut self) -> OptResult<Batch<EvaluationRequest>> {
        let count = self.batch_size.min(self.max_evaluations.saturating_sub(self.issued));
        let mut batch = Batch::new();
        for _ in 0..count {
            let index = self.issued as EvaluationIndex;
            let parameters = self.space.sample(&mut rng_for(self.seed, index));
            batch.insert(index, request_for(&parameters));
            self.in_flight.insert(index, parameters);
            self.issued += 1;
        }
        Ok(batch)
    }

    fn update(&mut self, outputs: Batch<EvaluationOutput>) -> OptResult<()> {
        record_batch(&mut self.tracker, &mut self.in_flight, &outputs)
    }

    fn result(&self) -> OptResult<FinalResult> {
        Ok(self.tracker.result())
    }
}

// ---- Adaptive search ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdaptiveConfig {
    pub space: SearchSpace,
    pub max_evaluations: usize,
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Probability of sampling the whole space instead of the best point's
    /// neighbourhood.
    #[serde(default = "default_exploration_weight")]
    pub exploration_weight: f64,
    /// Neighbourhood size as a fraction of each dimension's range.
    #[serde(default = "default_perturbation")]
    pub perturbation: f64,
    #[serde(default = "default_objective_key")]
    pub objective_key: String,
    #[serde(default)]
    pub direction: ObjectiveDirection,
}

/// Explore/exploit search that biases later rounds toward the best point
/// seen so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveSearch {
    space: SearchSpace,
    seed: u64,
    max_evaluations: usize,
    batch_size: usize,
    exploration_weight: f64,
    perturbation: f64,
    issued: usize,
    in_flight: Batch<Parameters>,
    tracker: BestTracker,
}

impl AdaptiveSearch {
    fn suggest(&self, index: EvaluationIndex) -> Parameters {
        let mut rng = rng_for(self.seed, index);
        match &self.tracker.best {
            Some(best) if rng.gen::<f64>() >= self.exploration_weight => {
                self.space.perturb(&best.parameters, self.perturbation, &mut rng)
            }
            _ => self.space.sample(&mut rng),
        }
    }
}

impl Algorithm for AdaptiveSearch {
    const NAME: &'static str = "adaptive";
    type Config = AdaptiveConfig;

    fn from_config(config: AdaptiveConfig) -> OptResult<Self> {
        config.space.validate(Self::NAME)?;
        check_batch_size(Self::NAME, config.batch_size)?;
        if !(0.0..=1.0).contains(&config.exploration_weight) {
            return Err(rd_types::config_error!(
                Self::NAME,
                "exploration_weight must lie in [0, 1], got {}",
                config.exploration_weight
            ));
        }
        if !(config.perturbation > 0.0 && config.perturbation <= 1.0) {
            return Err(rd_types::config_error!(
                Self::NAME,
                "perturbation must lie in (0, 1], got {}",
                config.perturbation
            ));
        }

        Ok(Self {
            space: config.space,
            seed: config.seed,
            max_evaluations: config.max_evaluations,
            batch_size: config.batch_size,
            exploration_weight: config.exploration_weight,
            perturbation: config.perturbation,
            issued: 0,
            in_flight: Batch::new(),
            tracker: BestTracker::new(config.direction, config.objective_key),
        })
    }

    fn is_finished(&self) -> bool {
        self.issued >= self.max_evaluations && self.in_flight.is_empty()
    }

    fn create_inputs(&mut self) -> OptResult<Batch<EvaluationRequest>> {
        let count = self.batch_size.min(self.max_evaluations.saturating_sub(self.issued));
        let mut batch = Batch::new();
        for _ in 0..count {
            let index = self.issued as EvaluationIndex;
            let parameters = self.suggest(index);
            batch.insert(index, request_for(&parameters));
            self.in_flight.insert(index, parameters);
            self.issued += 1;
        }
        Ok(batch)
    }

    fn update(&mut self, outputs: Batch<EvaluationOutput>) -> OptResult<()> {
        record_batch(&mut self.tracker, &mut self.in_flight, &outputs)
    }

    fn result(&self) -> OptResult<FinalResult> {
        Ok(self.tracker.result())
    }
}
