//! Run configuration.

use chrono::{DateTime, Utc};
use rd_types::{ConfigError, OptResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

/// Unique optimization run identifier.
pub type RunId = Uuid;

/// Everything the controller needs to create a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "Uuid::new_v4")]
    pub id: RunId,

    #[serde(default)]
    pub name: String,

    /// Registered name of the engine that drives the run.
    pub engine: String,

    /// Algorithm-specific hyperparameters, handed to the engine verbatim.
    #[serde(default = "empty_object")]
    pub engine_config: serde_json::Value,

    /// Calculation the task dispatcher runs for every evaluation request.
    pub calculation: String,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl RunConfig {
    pub fn new(engine: &str, calculation: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: String::new(),
            engine: engine.to_string(),
            engine_config: empty_object(),
            calculation: calculation.to_string(),
            created_at: Utc::now(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_id(mut self, id: RunId) -> Self {
        self.id = id;
        self
    }

    pub fn with_engine_config(mut self, config: serde_json::Value) -> Self {
        self.engine_config = config;
        self
    }

    /// Parse and validate a JSON run description.
    pub fn from_json_str(content: &str) -> OptResult<Self> {
        let config: Self = serde_json::from_str(content).map_err(|e| ConfigError::InvalidRun {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> OptResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&content)
    }

    pub fn validate(&self) -> OptResult<()> {
        if self.engine.trim().is_empty() {
            return Err(invalid("engine name is empty"));
        }
        if self.calculation.trim().is_empty() {
            return Err(invalid("calculation name is empty"));
        }
        if !self.engine_config.is_object() {
            return Err(invalid("engine_config must be a JSON object"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> rd_types::OptError {
    ConfigError::InvalidRun {
        message: message.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builder_chain() {
        let config = RunConfig::new("bisection", "echo")
            .with_name("root")
            .with_engine_config(json!({"lower": -1, "upper": 1, "tolerance": 0.1}));
        assert_eq!(config.engine, "bisection");
        assert_eq!(config.name, "root");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_minimal_json() {
        let config = RunConfig::from_json_str(
            r#"{"engine": "grid", "calculation": "echo",
                "engine_config": {"space": []}}"#,
        )
        .unwrap();
        assert_eq!(config.engine, "grid");
        assert_eq!(config.engine_config, json!({"space": []}));
    }

    #[test]
    fn missing_engine_config_defaults_to_empty_object() {
        let config =
            RunConfig::from_json_str(r#"{"engine": "grid", "calculation": "echo"}"#).unwrap();
        assert_eq!(config.engine_config, json!({}));
    }

    #[test]
    fn rejects_non_object_engine_config() {
        let err = RunConfig::from_json_str(
            r#"{"engine": "grid", "calculation": "echo", "engine_config": [1, 2]}"#,
        )
        .unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn rejects_blank_names_and_bad_json() {
        assert!(RunConfig::new(" ", "echo").validate().is_err());
        assert!(RunConfig::new("grid", "").validate().is_err());
        assert!(RunConfig::from_json_str("{not json").unwrap_err().is_config());
    }

    #[test]
    fn config_round_trip() {
        let config = RunConfig::new("bisection", "echo").with_name("r");
        let json = serde_json::to_string(&config).unwrap();
        let back: RunConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }
}
