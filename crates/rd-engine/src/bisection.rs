//! Bisection root finding over a one-dimensional bracket.

use rd_types::{
    Batch, ConfigError, EvaluationIndex, EvaluationOutput, EvaluationRequest, FinalResult,
    OptResult, TaskError,
};
use serde::{Deserialize, Serialize};

use crate::engine::Algorithm;

fn default_input_key() -> String {
    "x".to_string()
}

fn default_result_key() -> String {
    "result".to_string()
}

/// Hyperparameters for [`Bisection`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BisectionConfig {
    pub lower: f64,
    pub upper: f64,
    pub tolerance: f64,
    /// Input name the probe position is written under.
    #[serde(default = "default_input_key")]
    pub input_key: String,
    /// Output name the function value is read from.
    #[serde(default = "default_result_key")]
    pub result_key: String,
    /// Function value being searched for.
    #[serde(default)]
    pub target: f64,
}

impl BisectionConfig {
    pub fn new(lower: f64, upper: f64, tolerance: f64) -> Self {
        Self {
            lower,
            upper,
            tolerance,
            input_key: default_input_key(),
            result_key: default_result_key(),
            target: 0.0,
        }
    }
}

/// Finds `x` in `[lower, upper]` with `f(x) == target`.
///
/// The first round probes both ends of the bracket to learn which side lies
/// below the target; every later round probes the midpoint. Indices grow
/// monotonically over the whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bisection {
    config: BisectionConfig,
    lower: f64,
    upper: f64,
    /// Whether `f(lower) - target` is negative; unknown until the bounds
    /// have been evaluated.
    lower_below: Option<bool>,
    next_index: EvaluationIndex,
    /// Probe position per outstanding index.
    probes: Batch<f64>,
    last_index: Option<EvaluationIndex>,
    converged: bool,
}

impl Bisection {
    fn value_of(&self, index: EvaluationIndex, output: &EvaluationOutput) -> OptResult<f64> {
        output
            .get_f64(&self.config.result_key)
            .map(|v| v - self.config.target)
            .ok_or_else(|| {
                TaskError::MalformedOutput {
                    index,
                    message: format!("no numeric '{}' in output", self.config.result_key),
                }
                .into()
            })
    }

    fn probe(&mut self, position: f64) -> (EvaluationIndex, EvaluationRequest) {
        let index = self.next_index;
        self.next_index += 1;
        self.probes.insert(index, position);
        (
            index,
            EvaluationRequest::new().with(self.config.input_key.clone(), position),
        )
    }

    fn hit(&mut self, index: EvaluationIndex, position: f64) {
        self.lower = position;
        self.upper = position;
        self.last_index = Some(index);
        self.converged = true;
    }

    fn midpoint(&self) -> f64 {
        0.5 * self.lower + 0.5 * self.upper
    }

    /// Current bracket.
    pub fn bracket(&self) -> (f64, f64) {
        (self.lower, self.upper)
    }
}

impl Algorithm for Bisection {
    const NAME: &'static str = "bisection";
    type Config = BisectionConfig;

    fn from_config(config: BisectionConfig) -> OptResult<Self> {
        let finite = config.lower.is_finite() && config.upper.is_finite();
        if !finite || !(config.lower < config.upper) {
            return Err(ConfigError::InvalidBounds {
                lower: config.lower,
                upper: config.upper,
                message: "bounds must be finite with lower strictly below upper".to_string(),
            }
            .into());
        }
        if !(config.tolerance > 0.0) || !config.tolerance.is_finite() {
            return Err(rd_types::config_error!(
                Self::NAME,
                "tolerance must be positive and finite, got {}",
                config.tolerance
            ));
        }

        Ok(Self {
            lower: config.lower,
            upper: config.upper,
            config,
            lower_below: None,
            next_index: 0,
            probes: Batch::new(),
            last_index: None,
            converged: false,
        })
    }

    /// Also finished once no float lies strictly inside the bracket, since
    /// the midpoint can then no longer shrink it.
    fn is_finished(&self) -> bool {
        let mid = self.midpoint();
        self.converged
            || self.upper - self.lower < self.config.tolerance
            || mid <= self.lower
            || mid >= self.upper
    }

    fn create_inputs(&mut self) -> OptResult<Batch<EvaluationRequest>> {
        let mut batch = Batch::new();
        if self.lower_below.is_none() {
            let (lower, upper) = (self.lower, self.upper);
            batch.extend([self.probe(lower), self.probe(upper)]);
        } else {
            let mid = self.midpoint();
            batch.extend([self.probe(mid)]);
        }
        Ok(batch)
    }

    fn update(&mut self, outputs: Batch<EvaluationOutput>) -> OptResult<()> {
        let probes = std::mem::take(&mut self.probes);

        if self.lower_below.is_none() {
            let mut values = Vec::with_capacity(2);
            for (index, position) in &probes {
                let output = outputs.get(index).ok_or_else(|| {
                    rd_types::internal_error!("bisection output {index} missing")
                })?;
                values.push((*index, *position, self.value_of(*index, output)?));
            }
            let &[(lo_idx, lo_pos, lo_val), (hi_idx, hi_pos, hi_val)] = values.as_slice() else {
                return Err(rd_types::internal_error!(
                    "bracket round expects two probes, got {}",
                    values.len()
                ));
            };

            if lo_val == 0.0 {
                self.hit(lo_idx, lo_pos);
            } else if hi_val == 0.0 {
                self.hit(hi_idx, hi_pos);
            } else if (lo_val < 0.0) == (hi_val < 0.0) {
                return Err(ConfigError::InvalidBounds {
                    lower: self.lower,
                    upper: self.upper,
                    message: format!(
                        "bracket does not straddle the target (f(lower) - target = {lo_val}, f(upper) - target = {hi_val})"
                    ),
                }
                .into());
            } else {
                self.lower_below = Some(lo_val < 0.0);
                self.last_index = Some(hi_idx);
            }
            return Ok(());
        }

        for (index, position) in probes {
            let output = outputs
                .get(&index)
                .ok_or_else(|| rd_types::internal_error!("bisection output {index} missing"))?;
            let value = self.value_of(index, output)?;
            self.last_index = Some(index);

            if value == 0.0 {
                self.hit(index, position);
            } else if (value < 0.0) == self.lower_below.unwrap_or(true) {
                self.lower = position;
            } else {
                self.upper = position;
            }
        }
        Ok(())
    }

    fn result(&self) -> OptResult<FinalResult> {
        Ok(FinalResult::new(self.midpoint(), self.last_index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{AlgorithmEngine, Engine};
    use rd_types::OptError;
    use serde_json::json;

    /// Drive the engine through serialized state, evaluating `f` in place of
    /// the external tasks. Returns the final result and the number of rounds.
    fn solve(config: serde_json::Value, f: impl Fn(f64) -> f64) -> (FinalResult, usize) {
        let engine = AlgorithmEngine::<Bisection>::new();
        let mut state = engine.construct(&config).unwrap();
        let mut rounds = 0;
        loop {
            let mut session = engine.resume(&state).unwrap();
            if session.is_finished() {
                return (session.result().unwrap(), rounds);
            }
            let batch = session.create_inputs().unwrap();
            let outputs = batch
                .iter()
                .map(|(i, req)| {
                    let x = req.get("x").and_then(|v| v.as_f64()).unwrap();
                    (*i, EvaluationOutput::new().with("result", f(x)))
                })
                .collect();
            state = session.update(outputs).unwrap();
            rounds += 1;
        }
    }

    #[test]
    fn identity_converges_to_zero() {
        let (result, _) = solve(json!({"lower": -1, "upper": 1, "tolerance": 0.1}), |x| x);
        let value = result.value.as_f64().unwrap();
        assert!(value.abs() < 0.1, "result {value} too far from 0");
        assert!(result.index.is_some());
    }

    #[test]
    fn rounds_are_bounded_by_log2_of_bracket() {
        let tolerance: f64 = 1e-3;
        let (result, rounds) = solve(
            json!({"lower": -1.0, "upper": 2.0, "tolerance": tolerance}),
            |x| x - 0.3137,
        );
        let bound = (3.0 / tolerance).log2().ceil() as usize + 1;
        assert!(rounds <= bound, "{rounds} rounds exceeds bound {bound}");
        assert!((result.value.as_f64().unwrap() - 0.3137).abs() < tolerance);
    }

    #[test]
    fn tolerance_below_float_spacing_still_terminates() {
        let (result, rounds) = solve(
            json!({"lower": 1e10, "upper": 1e10 + 1.0, "tolerance": 1e-9}),
            |x| (x - 1e10) - 0.3,
        );
        // The bracket bottoms out at adjacent floats, about 2e-6 wide here.
        assert!(rounds < 64, "took {rounds} rounds");
        assert!((result.value.as_f64().unwrap() - (1e10 + 0.3)).abs() < 1e-5);
    }

    #[test]
    fn non_finite_bounds_are_rejected() {
        let err = Bisection::from_config(BisectionConfig::new(f64::NEG_INFINITY, 1.0, 0.1))
            .unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn decreasing_function_and_nonzero_target() {
        let (result, _) = solve(
            json!({"lower": 0.0, "upper": 10.0, "tolerance": 0.01, "target": 3.0}),
            |x| 10.0 - x,
        );
        assert!((result.value.as_f64().unwrap() - 7.0).abs() < 0.01);
    }

    #[test]
    fn exact_hit_on_bound_finishes_after_first_round() {
        let (result, rounds) = solve(json!({"lower": 0.0, "upper": 1.0, "tolerance": 1e-6}), |x| x);
        assert_eq!(rounds, 1);
        assert_eq!(result.value, json!(0.0));
        assert_eq!(result.index, Some(0));
    }

    #[test]
    fn custom_keys_are_used() {
        let engine = AlgorithmEngine::<Bisection>::new();
        let state = engine
            .construct(&json!({
                "lower": -1.0, "upper": 1.0, "tolerance": 0.5,
                "input_key": "t", "result_key": "energy"
            }))
            .unwrap();
        let mut session = engine.resume(&state).unwrap();
        let batch = session.create_inputs().unwrap();
        assert_eq!(batch[&0].get("t"), Some(&json!(-1.0)));
        assert_eq!(batch[&1].get("t"), Some(&json!(1.0)));
    }

    #[test]
    fn invalid_configuration_is_rejected_eagerly() {
        let engine = AlgorithmEngine::<Bisection>::new();
        for config in [
            json!({"lower": 1.0, "upper": -1.0, "tolerance": 0.1}),
            json!({"lower": -1.0, "upper": 1.0, "tolerance": 0.0}),
            json!({"lower": -1.0, "upper": 1.0}),
            json!({"lower": -1.0, "upper": 1.0, "tolerance": 0.1, "tol": 1}),
        ] {
            let err = engine.construct(&config).unwrap_err();
            assert!(err.is_config(), "{config} should be a config error, got {err}");
        }
    }

    #[test]
    fn bracket_without_sign_change_fails() {
        let engine = AlgorithmEngine::<Bisection>::new();
        let state = engine
            .construct(&json!({"lower": 1.0, "upper": 2.0, "tolerance": 0.1}))
            .unwrap();
        let mut session = engine.resume(&state).unwrap();
        let batch = session.create_inputs().unwrap();
        let outputs = batch
            .keys()
            .map(|i| (*i, EvaluationOutput::new().with("result", 5.0)))
            .collect();
        let err = session.update(outputs).unwrap_err();
        assert!(matches!(
            err,
            OptError::Config(ConfigError::InvalidBounds { .. })
        ));
    }

    #[test]
    fn indices_are_never_reused() {
        let engine = AlgorithmEngine::<Bisection>::new();
        let mut state = engine
            .construct(&json!({"lower": -1.0, "upper": 1.0, "tolerance": 0.01}))
            .unwrap();
        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..4 {
            let mut session = engine.resume(&state).unwrap();
            let batch = session.create_inputs().unwrap();
            for index in batch.keys() {
                assert!(seen.insert(*index), "index {index} reused");
            }
            let outputs = batch
                .iter()
                .map(|(i, req)| {
                    let x = req.get("x").and_then(|v| v.as_f64()).unwrap();
                    (*i, EvaluationOutput::new().with("result", x - 0.17))
                })
                .collect();
            state = session.update(outputs).unwrap();
        }
    }
}
