use thiserror::Error;

use crate::evaluation::EvaluationIndex;

/// Main error type for Rondo
#[derive(Error, Debug)]
pub enum OptError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Engine contract violation: {0}")]
    Contract(#[from] ContractViolation),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Path error: {0}")]
    Path(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OptError {
    /// Whether the error belongs to the configuration class, i.e. it was
    /// raised before anything was dispatched.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

/// Invalid engine configuration or chain wiring.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration for engine '{engine}': {message}")]
    InvalidEngineConfig { engine: String, message: String },

    #[error("Unknown engine: {name}")]
    UnknownEngine { name: String },

    #[error("Invalid bounds: lower {lower}, upper {upper}: {message}")]
    InvalidBounds {
        lower: f64,
        upper: f64,
        message: String,
    },

    #[error("Invalid run configuration: {message}")]
    InvalidRun { message: String },

    #[error(
        "'output_input_mappings' has inconsistent length: expected {expected} (process count - 1), got {actual}"
    )]
    MappingLengthMismatch { expected: usize, actual: usize },

    #[error("Input label '{label}' does not match any of the process labels")]
    UnknownProcessLabel { label: String },

    #[error("A chain needs at least one process")]
    EmptyChain,

    #[error("Duplicate process label: {label}")]
    DuplicateProcessLabel { label: String },

    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },
}

/// An engine behaved inconsistently with its contract. Always fatal.
#[derive(Error, Debug)]
pub enum ContractViolation {
    #[error("update received indices {actual:?}, but the outstanding batch is {expected:?}")]
    IndexMismatch {
        expected: Vec<EvaluationIndex>,
        actual: Vec<EvaluationIndex>,
    },

    #[error("result requested before the engine finished")]
    NotFinished,

    #[error("create_inputs called while {outstanding} evaluations are still outstanding")]
    BatchOutstanding { outstanding: usize },

    #[error("create_inputs produced an empty batch for an unfinished engine")]
    EmptyBatch,

    #[error("resume of engine '{engine}' is not deterministic: state changed on rehydration")]
    NonDeterministicResume { engine: String },

    #[error("winning index {index} does not refer to a collected evaluation")]
    UnknownWinningIndex { index: EvaluationIndex },

    #[error("state belongs to engine '{actual}', expected '{expected}'")]
    EngineMismatch { expected: String, actual: String },
}

/// Failures reported by the external task layer.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Task {label} failed: {message}")]
    Failed { label: String, message: String },

    #[error("Unknown task handle: {handle}")]
    UnknownHandle { handle: String },

    #[error("Unknown calculation: {name}")]
    UnknownCalculation { name: String },

    #[error("Task join error: {message}")]
    Join { message: String },

    #[error("Output of evaluation {index} is malformed: {message}")]
    MalformedOutput {
        index: EvaluationIndex,
        message: String,
    },
}

/// Errors from the resumable key-value store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Key not found: {key}")]
    NotFound { key: String },

    #[error("Round registry belongs to round {found}, expected round {expected}")]
    StaleRound { expected: u64, found: u64 },

    #[error("Corrupted entry {key}: {message}")]
    Corrupted { key: String, message: String },
}

/// Result type alias for Rondo operations
pub type OptResult<T> = Result<T, OptError>;

/// Macro for creating configuration errors for a named engine
#[macro_export]
macro_rules! config_error {
    ($engine:expr, $($arg:tt)*) => {
        $crate::OptError::Config($crate::ConfigError::InvalidEngineConfig {
            engine: $engine.to_string(),
            message: format!($($arg)*),
        })
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::OptError::Internal(format!($($arg)*))
    };
}
