//! Round registry: which task realizes which evaluation index in the current
//! round.
//!
//! Entries are keyed `calc_<index>` in their serialized form. Parsing a key
//! back to an index fails closed, so a foreign entry can never be mistaken for
//! one of ours. Every registry also carries the round it belongs to; the
//! controller refuses to collect a registry from another round.

use rd_types::{EvaluationIndex, OptResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

use crate::dispatch::TaskHandle;

/// Reserved prefix of every registry key.
pub const TASK_KEY_PREFIX: &str = "calc_";

/// Key a task is registered under.
pub fn task_key(index: EvaluationIndex) -> String {
    format!("{TASK_KEY_PREFIX}{index}")
}

/// Inverse of [`task_key`]. Anything that [`task_key`] could not have
/// produced yields `None`: a wrong prefix, an empty or non-decimal suffix,
/// a sign, or a leading zero.
pub fn parse_task_key(key: &str) -> Option<EvaluationIndex> {
    let digits = key.strip_prefix(TASK_KEY_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    digits.parse().ok()
}

/// Index to handle mapping for one round.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawRegistry", into = "RawRegistry")]
pub struct RoundRegistry {
    round: u64,
    tasks: BTreeMap<EvaluationIndex, TaskHandle>,
}

#[derive(Serialize, Deserialize)]
struct RawRegistry {
    round: u64,
    #[serde(default)]
    tasks: BTreeMap<String, Value>,
}

impl RoundRegistry {
    /// Empty registry for `round`.
    pub fn new(round: u64) -> Self {
        Self {
            round,
            tasks: BTreeMap::new(),
        }
    }

    /// Recover a registry from a loosely typed namespace that may also hold
    /// unrelated entries. Keys outside the reserved scheme are skipped.
    pub fn from_entries<I>(round: u64, entries: I) -> OptResult<Self>
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let mut registry = Self::new(round);
        for (key, value) in entries {
            let Some(index) = parse_task_key(&key) else {
                warn!("Ignoring foreign registry entry '{}'", key);
                continue;
            };
            let handle: TaskHandle = serde_json::from_value(value)?;
            registry.insert(index, handle)?;
        }
        Ok(registry)
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    /// Record the task dispatched for `index`. Each index is registered once.
    pub fn insert(&mut self, index: EvaluationIndex, handle: TaskHandle) -> OptResult<()> {
        if self.tasks.contains_key(&index) {
            return Err(rd_types::internal_error!(
                "index {index} registered twice in round {}",
                self.round
            ));
        }
        self.tasks.insert(index, handle);
        Ok(())
    }

    pub fn get(&self, index: EvaluationIndex) -> Option<&TaskHandle> {
        self.tasks.get(&index)
    }

    pub fn indices(&self) -> Vec<EvaluationIndex> {
        self.tasks.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (EvaluationIndex, &TaskHandle)> {
        self.tasks.iter().map(|(index, handle)| (*index, handle))
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn into_tasks(self) -> BTreeMap<EvaluationIndex, TaskHandle> {
        self.tasks
    }
}

impl TryFrom<RawRegistry> for RoundRegistry {
    type Error = String;

    fn try_from(raw: RawRegistry) -> Result<Self, Self::Error> {
        Self::from_entries(raw.round, raw.tasks).map_err(|e| e.to_string())
    }
}

impl From<RoundRegistry> for RawRegistry {
    fn from(registry: RoundRegistry) -> Self {
        let tasks = registry
            .tasks
            .into_iter()
            .filter_map(|(index, handle)| {
                serde_json::to_value(handle)
                    .ok()
                    .map(|value| (task_key(index), value))
            })
            .collect();
        Self {
            round: registry.round,
            tasks,
        }
    }
}
