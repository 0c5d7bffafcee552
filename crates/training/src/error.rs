use thiserror::Error;

/// Failures surfaced by the training pipeline.
///
/// Every variant is fatal for a run; nothing in the orchestrator retries.
#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ConfigFormat(String),
    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
    /// Missing dataset, unknown model name and similar startup problems.
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("trainer initialization failed: {0}")]
    Initialization(String),
    /// Restored state does not line up exactly with the live model or optimizer.
    #[error("checkpoint mismatch: {0}")]
    CheckpointMismatch(String),
    /// Batch fetch failed for a reason other than reaching the end of a pass.
    #[error("data loading failed: {0}")]
    Data(String),
    #[error("training failed: {0}")]
    Runtime(String),
}

impl TrainingError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn mismatch(message: impl Into<String>) -> Self {
        Self::CheckpointMismatch(message.into())
    }

    pub fn data(message: impl Into<String>) -> Self {
        Self::Data(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

pub(crate) fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
