//! error taxonomy for model loading, generation and configuration.
//!
//! user cancellation is deliberately absent: a stopped generation settles as
//! `GenerationOutcome::Cancelled`, not as an error.

use std::path::PathBuf;

use thiserror::Error;

/// model initialization failed. terminal for the session; the plugin never
/// retries on its own.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelLoadError {
    /// the runtime lacks a capability the backend needs (e.g. no usable
    /// compute backend, unknown provider).
    #[error("unsupported runtime: {0}")]
    UnsupportedRuntime(String),

    /// the model or backend could not be reached.
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// the backend answered but does not serve the requested model.
    #[error("model '{model}' is not available on the backend")]
    ModelUnavailable { model: String },

    /// the provider could not be constructed.
    #[error("initialization failed: {0}")]
    Init(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
}

/// a failure during streaming generation that was not caused by the user.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GenerationError {
    #[error("provider error: {0}")]
    Provider(String),

    #[error("stream error: {0}")]
    Stream(String),

    /// the task driving the generation went away before settling.
    #[error("generation task ended unexpectedly: {0}")]
    Task(String),
}

impl From<llm::error::LLMError> for GenerationError {
    fn from(err: llm::error::LLMError) -> Self {
        Self::Provider(err.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("failed to read config {path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("{field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid { field, reason: reason.into() }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_converts_into_load_error() {
        let err: ModelLoadError = ConfigError::invalid("top_p", "must be in (0, 1]").into();
        assert_eq!(err.to_string(), "invalid configuration: top_p: must be in (0, 1]");
    }

    #[test]
    fn unavailable_model_names_the_model() {
        let err = ModelLoadError::ModelUnavailable { model: "qwen2.5:0.5b".into() };
        assert!(err.to_string().contains("qwen2.5:0.5b"));
    }
}
