//! Task dispatch: the boundary to the external task layer.
//!
//! A dispatcher hands back a [`TaskHandle`] immediately and resolves it to
//! exactly one output later. It never retries and never times out; a task
//! that never finishes keeps its handle `Running` forever.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rd_types::{Bundle, EvaluationOutput, EvaluationRequest, OptResult, Process, TaskError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::controller::KEY_PREFIX;
use crate::store::{StateStore, StateStoreExt};

/// Message of a task whose process stopped before it finished.
pub const LOST_TASK_MESSAGE: &str = "task lost with its process";

/// Store key of a journaled task status.
pub fn task_status_key(id: &Uuid) -> String {
    format!("{KEY_PREFIX}tasks/{id}")
}

/// Opaque reference to one dispatched task. Serializable so it can be
/// persisted across a suspension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHandle {
    pub id: Uuid,
    /// Human-readable label, e.g. `calc_3`.
    pub label: String,
    /// Calculation the task runs.
    pub calculation: String,
    pub submitted_at: DateTime<Utc>,
}

impl TaskHandle {
    pub fn new(calculation: &str, label: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            label: label.to_string(),
            calculation: calculation.to_string(),
            submitted_at: Utc::now(),
        }
    }
}

impl std::fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.label, self.id)
    }
}

/// Where a dispatched task currently stands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskStatus {
    Running,
    Finished(EvaluationOutput),
    Failed { message: String },
}

/// The external task layer.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    /// Start `calculation` on `request`. Returns without waiting for it.
    async fn submit(
        &self,
        calculation: &str,
        label: &str,
        request: EvaluationRequest,
    ) -> OptResult<TaskHandle>;

    /// Current status of a previously submitted task.
    async fn poll(&self, handle: &TaskHandle) -> OptResult<TaskStatus>;

    /// Drop whatever is kept for a task whose result has been consumed.
    async fn forget(&self, _handle: &TaskHandle) -> OptResult<()> {
        Ok(())
    }
}

#[async_trait]
impl<D: TaskDispatcher + ?Sized> TaskDispatcher for Arc<D> {
    async fn submit(
        &self,
        calculation: &str,
        label: &str,
        request: EvaluationRequest,
    ) -> OptResult<TaskHandle> {
        (**self).submit(calculation, label, request).await
    }

    async fn poll(&self, handle: &TaskHandle) -> OptResult<TaskStatus> {
        (**self).poll(handle).await
    }

    async fn forget(&self, handle: &TaskHandle) -> OptResult<()> {
        (**self).forget(handle).await
    }
}

/// Runs registered [`Process`] calculations on the tokio runtime.
///
/// Task state lives in memory. With a journal every status is also written
/// to a [`StateStore`], so a dispatcher in a later process still resolves
/// tasks that finished before the earlier one stopped. A journaled task that
/// never finished reports [`LOST_TASK_MESSAGE`] as its failure.
#[derive(Default)]
pub struct LocalDispatcher {
    calculations: DashMap<String, Arc<dyn Process>>,
    tasks: Arc<DashMap<Uuid, TaskStatus>>,
    journal: Option<Arc<dyn StateStore>>,
    submitted: AtomicUsize,
}

impl LocalDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `process` available under `name`.
    pub fn register(&self, name: impl Into<String>, process: Arc<dyn Process>) -> &Self {
        self.calculations.insert(name.into(), process);
        self
    }

    pub fn with_calculation(self, name: impl Into<String>, process: Arc<dyn Process>) -> Self {
        self.register(name, process);
        self
    }

    /// Journal task statuses to `journal`.
    pub fn with_journal(mut self, journal: Arc<dyn StateStore>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Number of tasks submitted so far.
    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Number of tasks held in memory, i.e. not yet forgotten.
    pub fn tracked(&self) -> usize {
        self.tasks.len()
    }

    /// Number of tasks still running.
    pub fn running(&self) -> usize {
        self.tasks
            .iter()
            .filter(|entry| matches!(entry.value(), TaskStatus::Running))
            .count()
    }

    /// Wait until no submitted task is running.
    pub async fn settle(&self) {
        while self.running() > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
    }
}

#[async_trait]
impl TaskDispatcher for LocalDispatcher {
    async fn submit(
        &self,
        calculation: &str,
        label: &str,
        request: EvaluationRequest,
    ) -> OptResult<TaskHandle> {
        let process = self
            .calculations
            .get(calculation)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| TaskError::UnknownCalculation {
                name: calculation.to_string(),
            })?;

        let handle = TaskHandle::new(calculation, label);
        if let Some(journal) = &self.journal {
            journal.put(&task_status_key(&handle.id), &TaskStatus::Running)?;
        }
        self.tasks.insert(handle.id, TaskStatus::Running);
        self.submitted.fetch_add(1, Ordering::Relaxed);

        let tasks = Arc::clone(&self.tasks);
        let journal = self.journal.clone();
        let id = handle.id;
        let task_label = handle.label.clone();
        tokio::spawn(async move {
            let inputs: Bundle = request.inputs;
            // Inner task so a panicking process surfaces as a failure.
            let status = match tokio::spawn(async move { process.run(inputs).await }).await {
                Ok(Ok(outputs)) => TaskStatus::Finished(EvaluationOutput::from(outputs)),
                Ok(Err(e)) => TaskStatus::Failed {
                    message: e.to_string(),
                },
                Err(e) => TaskStatus::Failed {
                    message: TaskError::Join {
                        message: e.to_string(),
                    }
                    .to_string(),
                },
            };
            if let TaskStatus::Failed { message } = &status {
                warn!(task = %task_label, error = %message, "task failed");
            }
            // Journal first: once memory shows a final status the task may
            // be forgotten, and a later write would resurrect it.
            if let Some(journal) = journal {
                if let Err(e) = journal.put(&task_status_key(&id), &status) {
                    warn!(task = %task_label, error = %e, "failed to journal task status");
                }
            }
            tasks.insert(id, status);
        });

        debug!(task = %handle, calculation, "submitted task");
        Ok(handle)
    }

    async fn poll(&self, handle: &TaskHandle) -> OptResult<TaskStatus> {
        if let Some(status) = self.tasks.get(&handle.id) {
            return Ok(status.value().clone());
        }

        let journaled = match &self.journal {
            Some(journal) => journal.load::<TaskStatus>(&task_status_key(&handle.id))?,
            None => None,
        };
        match journaled {
            Some(TaskStatus::Running) => {
                warn!(task = %handle, "task was running when its process stopped");
                Ok(TaskStatus::Failed {
                    message: LOST_TASK_MESSAGE.to_string(),
                })
            }
            Some(status) => Ok(status),
            None => Err(TaskError::UnknownHandle {
                handle: handle.to_string(),
            }
            .into()),
        }
    }

    async fn forget(&self, handle: &TaskHandle) -> OptResult<()> {
        self.tasks.remove(&handle.id);
        if let Some(journal) = &self.journal {
            journal.delete(&task_status_key(&handle.id))?;
        }
        Ok(())
    }
}
