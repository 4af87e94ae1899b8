//! startup configuration.
//!
//! read once, before the model loads; nothing here is changeable at runtime.
//! layering: built-in defaults, then an optional json file, then environment.

use std::path::Path;

use bevy::prelude::Resource;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::inference::GenerationOptions;
use crate::prompt::{ChatTemplate, DEFAULT_SYSTEM_PREAMBLE};

pub const DEFAULT_GREETING: &str = "DeepDrift node online. Neural link established.";

/// tag appended to model ids when `quantized` is set and the id names no
/// quantization of its own.
pub const DEFAULT_QUANT_SUFFIX: &str = "-q4_K_M";

const QUANT_MARKERS: &[&str] = &["q2_", "q3_", "q4_", "q5_", "q6_", "q8_", "fp16", "f16", "int4", "int8"];

/// which model to load, and from where.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// `llm` backend name (`ollama`, `openai`, ...).
    pub backend: String,
    pub model: String,
    /// prefer a quantized variant of `model`.
    pub quantized: bool,
    pub base_url: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// check the backend serves the model before reporting ready (ollama only).
    pub probe: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            backend: "ollama".to_string(),
            model: "qwen2.5:0.5b-instruct".to_string(),
            quantized: true,
            base_url: None,
            api_key: None,
            probe: true,
        }
    }
}

impl ModelConfig {
    /// the id actually requested from the backend.
    pub fn resolved_model(&self) -> String {
        let lower = self.model.to_ascii_lowercase();
        if self.quantized && !QUANT_MARKERS.iter().any(|m| lower.contains(m)) {
            format!("{}{}", self.model, DEFAULT_QUANT_SUFFIX)
        } else {
            self.model.clone()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend.trim().is_empty() {
            return Err(ConfigError::invalid("model.backend", "must not be empty"));
        }
        if self.model.trim().is_empty() {
            return Err(ConfigError::invalid("model.model", "must not be empty"));
        }
        Ok(())
    }
}

/// everything the chat plugin reads at startup.
///
/// insert as a resource before adding `DriftChatPlugin` to override the
/// defaults.
#[derive(Resource, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub model: ModelConfig,
    pub generation: GenerationOptions,
    pub template: ChatTemplate,
    pub system_preamble: String,
    /// most recent turns carried into each prompt.
    pub context_turns: usize,
    /// transcript line shown once the model is online. not part of the history.
    pub greeting: Option<String>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            generation: GenerationOptions::default(),
            template: ChatTemplate::default(),
            system_preamble: DEFAULT_SYSTEM_PREAMBLE.to_string(),
            context_turns: 3,
            greeting: Some(DEFAULT_GREETING.to_string()),
        }
    }
}

impl ChatConfig {
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_json_str(&text)
    }

    /// defaults overlaid with the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env()
    }

    pub fn with_env(self) -> Result<Self, ConfigError> {
        self.with_env_from(|key| std::env::var(key).ok())
    }

    /// overlay `DRIFT_*` variables (plus the `LLM_BASE_URL` / `OPENAI_API_KEY`
    /// fallbacks) read through `lookup`.
    pub fn with_env_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(backend) = var("DRIFT_BACKEND") {
            self.model.backend = backend;
        }
        if let Some(model) = var("DRIFT_MODEL") {
            self.model.model = model;
        }
        if let Some(url) = var("DRIFT_BASE_URL").or_else(|| var("LLM_BASE_URL")) {
            self.model.base_url = Some(url);
        }
        if let Some(key) = var("DRIFT_API_KEY").or_else(|| var("OPENAI_API_KEY")) {
            self.model.api_key = Some(key);
        }
        if let Some(flag) = var("DRIFT_QUANTIZED") {
            self.model.quantized = parse_flag("DRIFT_QUANTIZED", &flag)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.model.validate()?;
        self.generation.validate()
    }
}

fn parse_flag(field: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::invalid(field, format!("expected a boolean, got '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn quantized_models_get_a_suffix_once() {
        let mut m = ModelConfig { model: "qwen2.5:0.5b-instruct".into(), ..Default::default() };
        assert_eq!(m.resolved_model(), "qwen2.5:0.5b-instruct-q4_K_M");

        m.model = "qwen2.5:0.5b-instruct-q8_0".into();
        assert_eq!(m.resolved_model(), "qwen2.5:0.5b-instruct-q8_0");

        m.model = "gpt-4o-mini".into();
        m.quantized = false;
        assert_eq!(m.resolved_model(), "gpt-4o-mini");
    }

    #[test]
    fn env_overlays_defaults() {
        let config = ChatConfig::default()
            .with_env_from(env(&[
                ("DRIFT_BACKEND", "openai"),
                ("DRIFT_MODEL", "gpt-4o-mini"),
                ("LLM_BASE_URL", "https://api.openai.com/v1"),
                ("OPENAI_API_KEY", "sk-test"),
                ("DRIFT_QUANTIZED", "off"),
            ]))
            .unwrap();
        assert_eq!(config.model.backend, "openai");
        assert_eq!(config.model.model, "gpt-4o-mini");
        assert_eq!(config.model.base_url.as_deref(), Some("https://api.openai.com/v1"));
        assert_eq!(config.model.api_key.as_deref(), Some("sk-test"));
        assert!(!config.model.quantized);
    }

    #[test]
    fn drift_vars_win_over_fallbacks() {
        let config = ChatConfig::default()
            .with_env_from(env(&[("DRIFT_BASE_URL", "http://box:11434"), ("LLM_BASE_URL", "http://other")]))
            .unwrap();
        assert_eq!(config.model.base_url.as_deref(), Some("http://box:11434"));
    }

    #[test]
    fn bad_flag_is_rejected() {
        let err = ChatConfig::default().with_env_from(env(&[("DRIFT_QUANTIZED", "maybe")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "DRIFT_QUANTIZED", .. }));
    }

    #[test]
    fn loads_partial_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "template": "zephyr", "context_turns": 5, "generation": {{ "temperature": 0.2 }} }}"#
        )
        .unwrap();

        let config = ChatConfig::from_path(file.path()).unwrap();
        assert_eq!(config.template, ChatTemplate::Zephyr);
        assert_eq!(config.context_turns, 5);
        assert_eq!(config.generation.temperature, 0.2);
        assert_eq!(config.generation.max_new_tokens, 200);
        assert_eq!(config.model, ModelConfig::default());
    }

    #[test]
    fn invalid_file_values_fail_validation() {
        let err = ChatConfig::from_json_str(r#"{ "generation": { "top_p": 2.0 } }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "top_p", .. }));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ChatConfig::from_path(dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn api_key_is_never_serialized() {
        let mut config = ChatConfig::default();
        config.model.api_key = Some("sk-secret".into());
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("sk-secret"));
    }
}
