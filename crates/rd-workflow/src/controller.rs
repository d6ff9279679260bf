//! The run controller: a checkpointed scatter/gather state machine.
//!
//! ```text
//! Creating ─▶ Ready ─▶ AwaitingRound ─▶ Ready ─▶ … ─▶ Finalizing ─▶ Done
//! ```
//!
//! `Ready` is the loop head. From there the engine either reports completion
//! or hands out a batch, which is dispatched and recorded in the round
//! registry before the checkpoint moves to `AwaitingRound`. Collection is all
//! or nothing: the engine is only updated once every task of the round has
//! finished. Every transition is written to the store before the next step
//! starts, so a controller can be dropped at any suspension point and rebuilt
//! with [`Controller::load`].

use chrono::{DateTime, Utc};
use rd_engine::{Engine, EngineRegistry, Session};
use rd_types::{
    AlgorithmState, Batch, ConfigError, EvaluationIndex, OptResult, StoreError, TaskError,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{RunConfig, RunId};
use crate::dispatch::{TaskDispatcher, TaskStatus};
use crate::finalize::{finalize, CollectedTask, RunOutputs, TaskArchive};
use crate::registry::{task_key, RoundRegistry};
use crate::store::{StateStore, StateStoreExt};

/// Prefix of every key the controller writes.
pub const KEY_PREFIX: &str = "rondo/";

/// Store key of a run's checkpoint.
pub fn checkpoint_key(run: &RunId) -> String {
    format!("{KEY_PREFIX}{run}/checkpoint")
}

/// Store key of a run's round registry.
pub fn round_key(run: &RunId) -> String {
    format!("{KEY_PREFIX}{run}/round")
}

/// Store key of the tasks collected in one round of a run.
pub fn archive_key(run: &RunId, round: u64) -> String {
    format!("{KEY_PREFIX}{run}/archive/{round}")
}

/// Where a run stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Creating,
    Ready,
    AwaitingRound,
    Finalizing,
    Done,
}

/// Everything needed to continue a run from scratch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run: RunConfig,
    pub phase: Phase,
    pub state: AlgorithmState,
    /// Number of completed rounds; also the epoch of the live registry.
    /// Each completed round's tasks are archived under [`archive_key`].
    pub round: u64,
    pub outputs: Option<RunOutputs>,
    pub updated_at: DateTime<Utc>,
}

/// Result of driving a run as far as it can go right now.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Waiting on `outstanding` tasks of `round`.
    Suspended { round: u64, outstanding: usize },
    Done(RunOutputs),
}

/// Transitions recorded for external consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunEvent {
    Created {
        run_id: RunId,
        engine: String,
    },
    RoundDispatched {
        round: u64,
        indices: Vec<EvaluationIndex>,
    },
    RoundCollected {
        round: u64,
        indices: Vec<EvaluationIndex>,
    },
    Finalized {
        winning_index: Option<EvaluationIndex>,
    },
}

enum Collection {
    Collected,
    Pending(usize),
}

/// Drives one optimization run. Generic over the store and task layer so
/// either can be swapped without touching the loop.
pub struct Controller<S: StateStore, D: TaskDispatcher> {
    store: S,
    dispatcher: D,
    engine: Arc<dyn Engine>,
    checkpoint: Checkpoint,
    events: Vec<RunEvent>,
}

impl<S: StateStore, D: TaskDispatcher> Controller<S, D> {
    /// Start a new run. The engine configuration is validated here, before
    /// anything is dispatched.
    pub fn create(
        run: RunConfig,
        engines: &EngineRegistry,
        store: S,
        dispatcher: D,
    ) -> OptResult<Self> {
        run.validate()?;
        if store.get(&checkpoint_key(&run.id))?.is_some() {
            return Err(ConfigError::InvalidRun {
                message: format!("run {} already exists", run.id),
            }
            .into());
        }

        let engine = engines.get(&run.engine)?;
        let state = engine.construct(&run.engine_config)?;
        info!(
            run_id = %run.id,
            "Creating run '{}' with engine '{}'",
            run.name,
            run.engine
        );

        let mut controller = Self {
            store,
            dispatcher,
            engine,
            checkpoint: Checkpoint {
                run,
                phase: Phase::Creating,
                state,
                round: 0,
                outputs: None,
                updated_at: Utc::now(),
            },
            events: Vec::new(),
        };
        controller.transition(Phase::Ready)?;
        controller.emit(RunEvent::Created {
            run_id: controller.checkpoint.run.id,
            engine: controller.checkpoint.run.engine.clone(),
        });
        Ok(controller)
    }

    /// Rebuild a run from the store alone.
    pub fn load(
        run_id: RunId,
        engines: &EngineRegistry,
        store: S,
        dispatcher: D,
    ) -> OptResult<Self> {
        let checkpoint: Checkpoint = store.require(&checkpoint_key(&run_id))?;
        let engine = engines.get(&checkpoint.run.engine)?;
        info!(
            run_id = %run_id,
            "Loaded run at round {} ({:?})",
            checkpoint.round,
            checkpoint.phase
        );

        Ok(Self {
            store,
            dispatcher,
            engine,
            checkpoint,
            events: Vec::new(),
        })
    }

    /// Load `run.id` if it exists, otherwise create it.
    pub fn load_or_create(
        run: RunConfig,
        engines: &EngineRegistry,
        store: S,
        dispatcher: D,
    ) -> OptResult<Self> {
        if store.get(&checkpoint_key(&run.id))?.is_some() {
            Self::load(run.id, engines, store, dispatcher)
        } else {
            Self::create(run, engines, store, dispatcher)
        }
    }

    pub fn run_id(&self) -> RunId {
        self.checkpoint.run.id
    }

    pub fn phase(&self) -> Phase {
        self.checkpoint.phase
    }

    pub fn round(&self) -> u64 {
        self.checkpoint.round
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    pub fn outputs(&self) -> Option<&RunOutputs> {
        self.checkpoint.outputs.as_ref()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// The archived task that produced `index`, if it has been collected.
    pub fn collected(&self, index: EvaluationIndex) -> OptResult<Option<CollectedTask>> {
        let run_id = self.run_id();
        // Recent rounds first: winners are usually found late.
        for round in (0..self.checkpoint.round).rev() {
            let archive: Option<TaskArchive> = self.store.load(&archive_key(&run_id, round))?;
            if let Some(task) = archive.and_then(|mut archive| archive.remove(&index)) {
                return Ok(Some(task));
            }
        }
        Ok(None)
    }

    /// Drain all recorded events.
    pub fn drain_events(&mut self) -> Vec<RunEvent> {
        std::mem::take(&mut self.events)
    }

    /// Advance until the run is done or waits on running tasks.
    pub async fn step(&mut self) -> OptResult<StepOutcome> {
        loop {
            match self.checkpoint.phase {
                Phase::Creating => {
                    return Err(rd_types::internal_error!(
                        "run {} was persisted before creation completed",
                        self.run_id()
                    ));
                }
                Phase::Ready => {
                    let mut session = self.engine.resume(&self.checkpoint.state)?;
                    if session.is_finished() {
                        // Left behind by a crash between checkpoint and delete.
                        if self.store.delete(&round_key(&self.run_id()))? {
                            warn!(run_id = %self.run_id(), "Removed stale round registry");
                        }
                        self.transition(Phase::Finalizing)?;
                    } else {
                        self.dispatch(session.as_mut()).await?;
                    }
                }
                Phase::AwaitingRound => match self.collect().await? {
                    Collection::Collected => {}
                    Collection::Pending(outstanding) => {
                        return Ok(StepOutcome::Suspended {
                            round: self.checkpoint.round,
                            outstanding,
                        });
                    }
                },
                Phase::Finalizing => {
                    let session = self.engine.resume(&self.checkpoint.state)?;
                    let outputs = finalize(session.as_ref(), |index| self.collected(index))?;
                    info!(
                        run_id = %self.run_id(),
                        "Run finished after {} rounds: {}",
                        self.checkpoint.round,
                        outputs.optimizer_result
                    );
                    self.emit(RunEvent::Finalized {
                        winning_index: outputs.winning_index,
                    });
                    self.checkpoint.outputs = Some(outputs);
                    self.transition(Phase::Done)?;
                }
                Phase::Done => {
                    let outputs = self.checkpoint.outputs.clone().ok_or_else(|| {
                        StoreError::Corrupted {
                            key: checkpoint_key(&self.run_id()),
                            message: "finished run has no outputs".to_string(),
                        }
                    })?;
                    return Ok(StepOutcome::Done(outputs));
                }
            }
        }
    }

    /// Step until done, sleeping `poll_interval` between suspensions.
    pub async fn run_to_completion(&mut self, poll_interval: Duration) -> OptResult<RunOutputs> {
        loop {
            match self.step().await? {
                StepOutcome::Done(outputs) => return Ok(outputs),
                StepOutcome::Suspended { round, outstanding } => {
                    debug!("Round {} waiting on {} tasks", round, outstanding);
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }
    }

    async fn dispatch(&mut self, session: &mut dyn Session) -> OptResult<()> {
        let run_id = self.run_id();
        let round = self.checkpoint.round;
        let key = round_key(&run_id);
        if self.store.get(&key)?.is_some() {
            warn!(run_id = %run_id, "Discarding stale round registry before round {}", round);
        }

        let batch = session.create_inputs()?;
        let mut registry = RoundRegistry::new(round);
        for (index, request) in batch {
            let label = task_key(index);
            let handle = self
                .dispatcher
                .submit(&self.checkpoint.run.calculation, &label, request)
                .await?;
            debug!("Dispatched {} for round {}", handle, round);
            registry.insert(index, handle)?;
        }

        // Registry before checkpoint: an `AwaitingRound` checkpoint always
        // has its registry in the store.
        self.store.put(&key, &registry)?;
        self.checkpoint.state = session.state()?;
        self.transition(Phase::AwaitingRound)?;

        let indices = registry.indices();
        info!(run_id = %run_id, "Round {} dispatched {} tasks", round, indices.len());
        self.emit(RunEvent::RoundDispatched { round, indices });
        Ok(())
    }

    async fn collect(&mut self) -> OptResult<Collection> {
        let run_id = self.run_id();
        let key = round_key(&run_id);
        let registry: RoundRegistry = self.store.require(&key)?;
        if registry.round() != self.checkpoint.round {
            return Err(StoreError::StaleRound {
                expected: self.checkpoint.round,
                found: registry.round(),
            }
            .into());
        }

        let mut outputs = Batch::new();
        let mut running = 0;
        for (index, handle) in registry.iter() {
            match self.dispatcher.poll(handle).await? {
                TaskStatus::Running => running += 1,
                TaskStatus::Finished(output) => {
                    outputs.insert(index, output);
                }
                TaskStatus::Failed { message } => {
                    return Err(TaskError::Failed {
                        label: handle.label.clone(),
                        message,
                    }
                    .into());
                }
            }
        }
        if running > 0 {
            return Ok(Collection::Pending(running));
        }

        let round = registry.round();
        let mut session = self.engine.resume(&self.checkpoint.state)?;
        self.checkpoint.state = session.update(outputs.clone())?;

        let indices = registry.indices();
        let mut archive = TaskArchive::new();
        for (index, handle) in registry.into_tasks() {
            if let Some(output) = outputs.remove(&index) {
                archive.insert(
                    index,
                    CollectedTask {
                        round,
                        handle,
                        output,
                    },
                );
            }
        }
        // Archive before checkpoint: a `Ready` checkpoint never points past
        // an unarchived round. Rewriting it on a repeated collection is
        // harmless.
        self.store.put(&archive_key(&run_id, round), &archive)?;
        self.checkpoint.round += 1;
        self.transition(Phase::Ready)?;
        self.store.delete(&key)?;
        for task in archive.values() {
            self.dispatcher.forget(&task.handle).await?;
        }

        info!(run_id = %run_id, "Round {} collected {} outputs", round, indices.len());
        self.emit(RunEvent::RoundCollected { round, indices });
        Ok(Collection::Collected)
    }

    fn transition(&mut self, phase: Phase) -> OptResult<()> {
        debug!(
            "Run {} phase {:?} -> {:?}",
            self.checkpoint.run.id, self.checkpoint.phase, phase
        );
        self.checkpoint.phase = phase;
        self.checkpoint.updated_at = Utc::now();
        self.store
            .put(&checkpoint_key(&self.checkpoint.run.id), &self.checkpoint)
    }

    fn emit(&mut self, event: RunEvent) {
        self.events.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::LocalDispatcher;
    use crate::store::MemoryStore;
    use rd_types::{EchoResult, OptError};
    use serde_json::json;

    fn bisection_run() -> RunConfig {
        RunConfig::new("bisection", "echo")
            .with_engine_config(json!({"lower": -1.0, "upper": 1.0, "tolerance": 0.1}))
    }

    fn parts() -> (Arc<MemoryStore>, Arc<LocalDispatcher>) {
        let dispatcher = LocalDispatcher::new().with_calculation("echo", Arc::new(EchoResult));
        (Arc::new(MemoryStore::new()), Arc::new(dispatcher))
    }

    #[test]
    fn create_persists_a_ready_checkpoint() {
        let (store, dispatcher) = parts();
        let mut controller = Controller::create(
            bisection_run(),
            &EngineRegistry::with_builtins(),
            Arc::clone(&store),
            dispatcher,
        )
        .unwrap();

        assert_eq!(controller.phase(), Phase::Ready);
        let checkpoint: Checkpoint = store.require(&checkpoint_key(&controller.run_id())).unwrap();
        assert_eq!(checkpoint.phase, Phase::Ready);
        assert_eq!(checkpoint.round, 0);
        assert!(matches!(
            controller.drain_events().as_slice(),
            [RunEvent::Created { .. }]
        ));
    }

    #[test]
    fn invalid_engine_config_fails_before_anything_is_written() {
        let (store, dispatcher) = parts();
        let run = RunConfig::new("bisection", "echo")
            .with_engine_config(json!({"lower": 1.0, "upper": -1.0, "tolerance": 0.1}));
        let err = Controller::create(
            run,
            &EngineRegistry::with_builtins(),
            Arc::clone(&store),
            Arc::clone(&dispatcher),
        )
        .err()
        .unwrap();
        assert!(err.is_config());
        assert!(store.is_empty());
        assert_eq!(dispatcher.submitted(), 0);
    }

    #[test]
    fn unknown_engine_is_rejected() {
        let (store, dispatcher) = parts();
        let err = Controller::create(
            RunConfig::new("simplex", "echo"),
            &EngineRegistry::with_builtins(),
            store,
            dispatcher,
        )
        .err()
        .unwrap();
        assert!(matches!(
            err,
            OptError::Config(ConfigError::UnknownEngine { .. })
        ));
    }

    #[test]
    fn duplicate_run_id_is_rejected() {
        let (store, dispatcher) = parts();
        let run = bisection_run();
        let engines = EngineRegistry::with_builtins();
        Controller::create(run.clone(), &engines, Arc::clone(&store), Arc::clone(&dispatcher))
            .unwrap();
        assert!(Controller::create(run, &engines, store, dispatcher).is_err());
    }

    #[tokio::test]
    async fn step_dispatches_then_collects() {
        let (store, dispatcher) = parts();
        let mut controller = Controller::create(
            bisection_run(),
            &EngineRegistry::with_builtins(),
            Arc::clone(&store),
            Arc::clone(&dispatcher),
        )
        .unwrap();
        let key = round_key(&controller.run_id());

        // The first round probes both bounds. Nothing has run yet on the
        // single-threaded test runtime.
        assert_eq!(
            controller.step().await.unwrap(),
            StepOutcome::Suspended {
                round: 0,
                outstanding: 2
            }
        );
        let registry: RoundRegistry = store.require(&key).unwrap();
        assert_eq!(registry.indices(), vec![0, 1]);
        assert_eq!(controller.phase(), Phase::AwaitingRound);

        dispatcher.settle().await;
        let outputs = controller
            .run_to_completion(Duration::from_millis(1))
            .await
            .unwrap();
        assert!(outputs.optimizer_result.as_f64().unwrap().abs() < 0.1);
        assert_eq!(controller.phase(), Phase::Done);
        assert!(store.get(&key).unwrap().is_none());
        // Collected tasks are released by the task layer.
        assert_eq!(dispatcher.tracked(), 0);
        let archived: TaskArchive = store.require(&archive_key(&controller.run_id(), 0)).unwrap();
        assert_eq!(archived.keys().copied().collect::<Vec<_>>(), vec![0, 1]);

        // A finished run keeps answering with its outputs.
        assert_eq!(
            controller.step().await.unwrap(),
            StepOutcome::Done(outputs)
        );
    }

    #[tokio::test]
    async fn finishing_removes_a_leftover_registry() {
        let (store, dispatcher) = parts();
        // A bracket narrower than the tolerance is finished before any round.
        let run = RunConfig::new("bisection", "echo")
            .with_engine_config(json!({"lower": -1.0, "upper": 1.0, "tolerance": 5.0}));
        let mut controller = Controller::create(
            run,
            &EngineRegistry::with_builtins(),
            Arc::clone(&store),
            Arc::clone(&dispatcher),
        )
        .unwrap();
        let key = round_key(&controller.run_id());
        store.put(&key, &RoundRegistry::new(0)).unwrap();

        let outcome = controller.step().await.unwrap();
        assert!(matches!(outcome, StepOutcome::Done(_)));
        assert!(store.get(&key).unwrap().is_none());
        assert_eq!(dispatcher.submitted(), 0);
    }
}
