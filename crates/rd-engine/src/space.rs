//! Search space definitions shared by the sampling engines.

use rand::Rng;
use rd_types::{ConfigError, EvaluationIndex, EvaluationOutput, OptResult, TaskError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single parameter dimension in the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Input name the sampled value is written under.
    pub name: String,
    /// The kind of search range.
    #[serde(flatten)]
    pub kind: ParameterKind,
}

/// Describes how a parameter is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParameterKind {
    /// Continuous uniform range [low, high].
    FloatRange { low: f64, high: f64 },
    /// Integer range [low, high] inclusive.
    IntRange { low: i64, high: i64 },
    /// Log-uniform range (sampled in log-space then exponentiated).
    LogUniform { low: f64, high: f64 },
    /// Categorical choices.
    Choice { values: Vec<serde_json::Value> },
}

/// A concrete parameter value produced by an engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Int(i64),
    Float(f64),
    Json(serde_json::Value),
}

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

impl From<ParameterValue> for serde_json::Value {
    fn from(value: ParameterValue) -> Self {
        match value {
            ParameterValue::Float(v) => serde_json::Value::from(v),
            ParameterValue::Int(v) => serde_json::Value::from(v),
            ParameterValue::Json(v) => v,
        }
    }
}

/// One point in the search space, keyed by parameter name.
pub type Parameters = BTreeMap<String, ParameterValue>;

/// The full search space: an ordered list of parameter definitions.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SearchSpace {
    pub parameters: Vec<ParameterDef>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self {
            parameters: Vec::new(),
        }
    }

    pub fn add_float(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::FloatRange { low, high },
        });
        self
    }

    pub fn add_int(mut self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::IntRange { low, high },
        });
        self
    }

    pub fn add_log_uniform(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::LogUniform { low, high },
        });
        self
    }

    pub fn add_choice(mut self, name: impl Into<String>, values: Vec<serde_json::Value>) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::Choice { values },
        });
        self
    }

    /// Reject spaces that cannot be sampled.
    pub fn validate(&self, engine: &str) -> OptResult<()> {
        if self.parameters.is_empty() {
            return Err(rd_types::config_error!(engine, "search space is empty"));
        }
        for param in &self.parameters {
            match &param.kind {
                ParameterKind::FloatRange { low, high } if !(low <= high) => {
                    return Err(invalid_bounds(&param.name, *low, *high));
                }
                ParameterKind::IntRange { low, high } if low > high => {
                    return Err(invalid_bounds(&param.name, *low as f64, *high as f64));
                }
                ParameterKind::LogUniform { low, high } if !(*low > 0.0 && low <= high) => {
                    return Err(invalid_bounds(&param.name, *low, *high));
                }
                ParameterKind::Choice { values } if values.is_empty() => {
                    return Err(rd_types::config_error!(
                        engine,
                        "parameter '{}' has no choices",
                        param.name
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Total number of grid points, continuous dimensions split into
    /// `float_steps` points. `None` if the count does not fit in `usize`.
    pub fn grid_size(&self, float_steps: usize) -> Option<usize> {
        self.parameters
            .iter()
            .try_fold(1usize, |total, param| {
                total.checked_mul(axis_len(&param.kind, float_steps)?)
            })
    }

    /// The grid point at `position`, counting with the last parameter
    /// varying fastest. `None` past the end of the grid.
    ///
    /// Points are decoded on demand, so the grid itself is never built.
    pub fn grid_point(&self, float_steps: usize, position: usize) -> Option<Parameters> {
        let mut rest = position;
        let mut point = Parameters::new();
        for param in self.parameters.iter().rev() {
            let len = axis_len(&param.kind, float_steps)?;
            point.insert(
                param.name.clone(),
                axis_value(&param.kind, float_steps, rest % len),
            );
            rest /= len;
        }
        (rest == 0).then_some(point)
    }

    /// Draw one point uniformly (log-uniformly where requested).
    pub fn sample<R: Rng>(&self, rng: &mut R) -> Parameters {
        self.parameters
            .iter()
            .map(|param| (param.name.clone(), sample_param(&param.kind, rng)))
            .collect()
    }

    /// Draw a point near `base`, moving each continuous dimension by at most
    /// `scale` of its range. Choices and missing coordinates are resampled.
    pub fn perturb<R: Rng>(&self, base: &Parameters, scale: f64, rng: &mut R) -> Parameters {
        let mut perturbed = Parameters::new();

        for param in &self.parameters {
            let value = match (&param.kind, base.get(&param.name)) {
                (ParameterKind::FloatRange { low, high }, Some(ParameterValue::Float(v))) => {
                    let noise = rng.gen_range(-scale..=scale) * (high - low);
                    ParameterValue::Float((v + noise).clamp(*low, *high))
                }
                (ParameterKind::IntRange { low, high }, Some(ParameterValue::Int(v))) => {
                    let reach = (((*high as f64 - *low as f64) * scale).ceil() as i64).max(1);
                    let delta: i64 = rng.gen_range(-reach..=reach);
                    ParameterValue::Int(v.saturating_add(delta).clamp(*low, *high))
                }
                (ParameterKind::LogUniform { low, high }, Some(ParameterValue::Float(v))) => {
                    let log_range = high.ln() - low.ln();
                    let noise = rng.gen_range(-scale..=scale) * log_range;
                    ParameterValue::Float((v.ln() + noise).exp().clamp(*low, *high))
                }
                (kind, _) => sample_param(kind, rng),
            };
            perturbed.insert(param.name.clone(), value);
        }

        perturbed
    }
}

fn axis_len(kind: &ParameterKind, float_steps: usize) -> Option<usize> {
    match kind {
        ParameterKind::FloatRange { .. } | ParameterKind::LogUniform { .. } => {
            Some(float_steps.max(2))
        }
        ParameterKind::IntRange { low, high } => {
            let span = u64::try_from(i128::from(*high) - i128::from(*low)).ok()?;
            usize::try_from(span).ok()?.checked_add(1)
        }
        ParameterKind::Choice { values } => Some(values.len()).filter(|len| *len > 0),
    }
}

/// The `i`-th value along one grid axis; `i` is below its [`axis_len`].
fn axis_value(kind: &ParameterKind, float_steps: usize, i: usize) -> ParameterValue {
    let t = i as f64 / (float_steps.max(2) - 1) as f64;
    match kind {
        ParameterKind::FloatRange { low, high } => ParameterValue::Float(low + t * (high - low)),
        ParameterKind::IntRange { low, .. } => {
            ParameterValue::Int((i128::from(*low) + i as i128) as i64)
        }
        ParameterKind::LogUniform { low, high } => {
            let (log_low, log_high) = (low.ln(), high.ln());
            ParameterValue::Float((log_low + t * (log_high - log_low)).exp())
        }
        ParameterKind::Choice { values } => ParameterValue::Json(values[i].clone()),
    }
}

fn sample_param<R: Rng>(kind: &ParameterKind, rng: &mut R) -> ParameterValue {
    match kind {
        ParameterKind::FloatRange { low, high } => ParameterValue::Float(rng.gen_range(*low..=*high)),
        ParameterKind::IntRange { low, high } => ParameterValue::Int(rng.gen_range(*low..=*high)),
        ParameterKind::LogUniform { low, high } => {
            let log_val: f64 = rng.gen_range(low.ln()..=high.ln());
            ParameterValue::Float(log_val.exp())
        }
        ParameterKind::Choice { values } => {
            let idx = rng.gen_range(0..values.len());
            ParameterValue::Json(values[idx].clone())
        }
    }
}

fn invalid_bounds(name: &str, lower: f64, upper: f64) -> rd_types::OptError {
    ConfigError::InvalidBounds {
        lower,
        upper,
        message: format!("parameter '{name}' has an empty or invalid range"),
    }
    .into()
}

// ---------------------------------------------------------------------------
// Objective tracking
// ---------------------------------------------------------------------------

/// Whether we are maximizing or minimizing the objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveDirection {
    Maximize,
    #[default]
    Minimize,
}

/// One evaluated point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub index: EvaluationIndex,
    pub objective: f64,
    pub parameters: Parameters,
}

/// Keeps the best observation seen so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestTracker {
    pub direction: ObjectiveDirection,
    pub objective_key: String,
    pub best: Option<Observation>,
    pub evaluated: usize,
}

impl BestTracker {
    pub fn new(direction: ObjectiveDirection, objective_key: impl Into<String>) -> Self {
        Self {
            direction,
            objective_key: objective_key.into(),
            best: None,
            evaluated: 0,
        }
    }

    /// Read the objective out of `output` and record it for `parameters`.
    pub fn record(
        &mut self,
        index: EvaluationIndex,
        parameters: Parameters,
        output: &EvaluationOutput,
    ) -> OptResult<()> {
        let objective = output.get_f64(&self.objective_key).ok_or_else(|| {
            TaskError::MalformedOutput {
                index,
                message: format!("no numeric '{}' in output", self.objective_key),
            }
        })?;
        self.update_best(Observation {
            index,
            objective,
            parameters,
        });
        Ok(())
    }

    /// Update the best observation if `candidate` improves on the current best.
    pub fn update_best(&mut self, candidate: Observation) {
        self.evaluated += 1;
        let improves = match &self.best {
            None => true,
            Some(current_best) => match self.direction {
                ObjectiveDirection::Maximize => candidate.objective > current_best.objective,
                ObjectiveDirection::Minimize => candidate.objective < current_best.objective,
            },
        };
        if improves {
            self.best = Some(candidate);
        }
    }

    /// The best point as a final result value, `null` if nothing was evaluated.
    pub fn result(&self) -> rd_types::FinalResult {
        match &self.best {
            Some(best) => rd_types::FinalResult::new(
                serde_json::json!({
                    "objective": best.objective,
                    "parameters": best.parameters,
                }),
                Some(best.index),
            ),
            None => rd_types::FinalResult::new(serde_json::Value::Null, None),
        }
    }
}
