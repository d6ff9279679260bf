//! Extracts the run's outputs once the engine reports completion.

use rd_engine::Session;
use rd_types::{ContractViolation, EvaluationIndex, EvaluationOutput, OptResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::dispatch::TaskHandle;

/// A task whose output has been consumed by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectedTask {
    pub round: u64,
    pub handle: TaskHandle,
    pub output: EvaluationOutput,
}

/// Collected tasks by index.
pub type TaskArchive = BTreeMap<EvaluationIndex, CollectedTask>;

/// What a finished run reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutputs {
    /// The engine's terminal value.
    pub optimizer_result: Value,
    pub winning_index: Option<EvaluationIndex>,
    /// Full output of the winning evaluation, when the engine names one.
    pub calculation_result: Option<EvaluationOutput>,
}

/// Read the terminal result from `session` and attach the winning task's
/// recorded output, looked up through `collected`.
pub fn finalize<F>(session: &dyn Session, collected: F) -> OptResult<RunOutputs>
where
    F: FnOnce(EvaluationIndex) -> OptResult<Option<CollectedTask>>,
{
    let result = session.result()?;

    let calculation_result = match result.index {
        None => None,
        Some(index) => {
            let task = collected(index)?.ok_or(ContractViolation::UnknownWinningIndex { index })?;
            Some(task.output)
        }
    };

    Ok(RunOutputs {
        optimizer_result: result.value,
        winning_index: result.index,
        calculation_result,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rd_engine::{AlgorithmEngine, Bisection, BisectionConfig, Engine};
    use rd_types::{Batch, OptError};
    use serde_json::json;

    fn finished_bisection() -> (Box<dyn Session>, Batch<EvaluationOutput>) {
        let engine = AlgorithmEngine::<Bisection>::new();
        let config = serde_json::to_value(BisectionConfig::new(0.0, 1.0, 1e-6)).unwrap();
        let state = engine.construct(&config).unwrap();
        let mut session = engine.resume(&state).unwrap();
        let batch = session.create_inputs().unwrap();
        // f(0) == 0 is an exact hit on the lower bound.
        let outputs: Batch<EvaluationOutput> = batch
            .iter()
            .map(|(i, req)| {
                let x = req.get("x").cloned().unwrap();
                (*i, EvaluationOutput::new().with("result", x))
            })
            .collect();
        session.update(outputs.clone()).unwrap();
        (session, outputs)
    }

    fn archive_of(outputs: &Batch<EvaluationOutput>) -> TaskArchive {
        outputs
            .iter()
            .map(|(index, output)| {
                (
                    *index,
                    CollectedTask {
                        round: 0,
                        handle: TaskHandle::new("echo", &crate::registry::task_key(*index)),
                        output: output.clone(),
                    },
                )
            })
            .collect()
    }

    #[test]
    fn winning_output_is_surfaced() {
        let (session, outputs) = finished_bisection();
        let archive = archive_of(&outputs);
        let run = finalize(session.as_ref(), |index| Ok(archive.get(&index).cloned())).unwrap();
        assert_eq!(run.optimizer_result, json!(0.0));
        assert_eq!(run.winning_index, Some(0));
        assert_eq!(
            run.calculation_result.unwrap().get("result"),
            Some(&json!(0.0))
        );
    }

    #[test]
    fn winning_index_missing_from_archive_is_a_violation() {
        let (session, _) = finished_bisection();
        let err = finalize(session.as_ref(), |_| Ok(None)).unwrap_err();
        assert!(matches!(
            err,
            OptError::Contract(ContractViolation::UnknownWinningIndex { index: 0 })
        ));
    }

    #[test]
    fn unfinished_session_cannot_be_finalized() {
        let engine = AlgorithmEngine::<Bisection>::new();
        let config = serde_json::to_value(BisectionConfig::new(-1.0, 1.0, 0.1)).unwrap();
        let session = engine.resume(&engine.construct(&config).unwrap()).unwrap();
        assert!(matches!(
            finalize(session.as_ref(), |_| Ok(None)).unwrap_err(),
            OptError::Contract(ContractViolation::NotFinished)
        ));
    }
}
