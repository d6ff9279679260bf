//! # rd-workflow
//!
//! Resumable scatter/gather optimization for Rondo.
//!
//! A [`Controller`] owns one run: it asks the engine for a batch of
//! evaluation requests, submits each as an external task through a
//! [`TaskDispatcher`], records which task realizes which index in a
//! [`RoundRegistry`], and feeds the outputs back once the whole round has
//! finished. Every transition is checkpointed in a [`StateStore`], so a run
//! survives being dropped between rounds.

pub mod config;
pub mod controller;
pub mod dispatch;
pub mod finalize;
pub mod registry;
pub mod store;

pub use config::{RunConfig, RunId};
pub use controller::{
    archive_key, checkpoint_key, round_key, Checkpoint, Controller, Phase, RunEvent, StepOutcome,
};
pub use dispatch::{
    task_status_key, LocalDispatcher, TaskDispatcher, TaskHandle, TaskStatus, LOST_TASK_MESSAGE,
};
pub use finalize::{finalize, CollectedTask, RunOutputs, TaskArchive};
pub use registry::{parse_task_key, task_key, RoundRegistry, TASK_KEY_PREFIX};
pub use store::{FileStore, MemoryStore, StateStore, StateStoreExt};
