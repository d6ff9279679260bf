use async_trait::async_trait;
use rd_types::{Bundle, ConfigError, OptResult, Process};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::path::PortPath;

/// Output path of one stage to input path of the next, as written by users.
pub type Mapping = BTreeMap<String, String>;

/// Outputs of every stage, by label.
pub type ChainOutputs = BTreeMap<String, Bundle>;

struct Stage {
    label: String,
    process: Arc<dyn Process>,
}

/// Processes run one after another, each fed from its predecessor's outputs.
///
/// Wiring is checked when the chain is built, so a misconfigured chain never
/// starts any of its processes.
pub struct Chain {
    name: String,
    stages: Vec<Stage>,
    inputs: BTreeMap<String, Bundle>,
    mappings: Vec<Vec<(PortPath, PortPath)>>,
}

impl Chain {
    /// Build a chain.
    ///
    /// `inputs` holds the initial inputs per stage label. `mappings[i]`
    /// relocates outputs of stage `i` into the inputs of stage `i + 1`, so
    /// there must be exactly one mapping fewer than there are stages.
    pub fn new(
        stages: Vec<(String, Arc<dyn Process>)>,
        inputs: BTreeMap<String, Bundle>,
        mappings: Vec<Mapping>,
    ) -> OptResult<Self> {
        if stages.is_empty() {
            return Err(ConfigError::EmptyChain.into());
        }

        let mut labels = BTreeSet::new();
        for (label, _) in &stages {
            if !labels.insert(label.as_str()) {
                return Err(ConfigError::DuplicateProcessLabel {
                    label: label.clone(),
                }
                .into());
            }
        }

        if mappings.len() != stages.len() - 1 {
            return Err(ConfigError::MappingLengthMismatch {
                expected: stages.len() - 1,
                actual: mappings.len(),
            }
            .into());
        }

        if let Some(label) = inputs.keys().find(|label| !labels.contains(label.as_str())) {
            return Err(ConfigError::UnknownProcessLabel {
                label: label.clone(),
            }
            .into());
        }

        let mappings = mappings
            .iter()
            .map(|mapping| {
                mapping
                    .iter()
                    .map(|(source, target)| Ok((PortPath::parse(source)?, PortPath::parse(target)?)))
                    .collect::<OptResult<Vec<_>>>()
            })
            .collect::<OptResult<Vec<_>>>()?;

        let stages = stages
            .into_iter()
            .map(|(label, process)| Stage { label, process })
            .collect();

        Ok(Self {
            name: "chain".to_string(),
            stages,
            inputs,
            mappings,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Stage labels in execution order.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|stage| stage.label.as_str())
    }

    /// Run every stage and collect all outputs.
    pub async fn run(&self) -> OptResult<ChainOutputs> {
        self.run_with(Bundle::new()).await
    }

    /// Like [`Chain::run`], with `extra` written over the first stage's
    /// initial inputs.
    pub async fn run_with(&self, extra: Bundle) -> OptResult<ChainOutputs> {
        let mut outputs = ChainOutputs::new();
        let mut extra = Some(extra);

        for (position, stage) in self.stages.iter().enumerate() {
            let mut inputs = self.inputs.get(&stage.label).cloned().unwrap_or_default();
            if let Some(extra) = extra.take() {
                inputs.extend(extra);
            } else {
                let prior_label = &self.stages[position - 1].label;
                let prior = outputs.get(prior_label).ok_or_else(|| {
                    rd_types::internal_error!("outputs of stage '{prior_label}' missing")
                })?;
                for (source, target) in &self.mappings[position - 1] {
                    target.set(&mut inputs, source.get(prior)?.clone())?;
                }
            }

            debug!("Running stage '{}' ({})", stage.label, stage.process.name());
            let produced = match stage.process.run(inputs).await {
                Ok(produced) => produced,
                Err(e) => {
                    warn!("Stage '{}' of chain '{}' failed: {}", stage.label, self.name, e);
                    return Err(e);
                }
            };
            outputs.insert(stage.label.clone(), produced);
        }

        info!("Chain '{}' finished {} stages", self.name, self.stages.len());
        Ok(outputs)
    }
}

/// As a process, a chain takes the first stage's extra inputs and yields the
/// last stage's outputs.
#[async_trait]
impl Process for Chain {
    async fn run(&self, inputs: Bundle) -> OptResult<Bundle> {
        let mut outputs = self.run_with(inputs).await?;
        let last = self
            .stages
            .last()
            .ok_or(ConfigError::EmptyChain)?;
        Ok(outputs.remove(&last.label).unwrap_or_default())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("name", &self.name)
            .field("stages", &self.labels().collect::<Vec<_>>())
            .finish()
    }
}
