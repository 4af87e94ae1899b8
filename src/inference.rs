//! the seam to the external inference engine.
//!
//! the controller only sees [`InferenceClient`] / [`ModelLoader`]. the default
//! implementation wraps the `llm` crate; tests and alternative engines plug in
//! their own.
//!
//! api docs for the wrapped types: https://docs.rs/llm
//!   - provider:   `llm::LLMProvider`, `llm::builder::{LLMBuilder, LLMBackend}`
//!   - streaming:  `llm::chat::{StreamResponse, StreamChoice, StreamDelta}`
//!
//! not every `llm` backend streams the same way. generation tries, in order:
//! structured streaming (`chat_stream_struct`, openai-style), plain text
//! streaming (`chat_stream`, ollama), then a one-shot `chat()` whose reply is
//! replayed word by word so stop and the token cap still apply.

use std::sync::Arc;

use async_trait::async_trait;
use bevy::log::{debug, error, info, warn};
use futures_lite::{Stream, StreamExt};
use llm::{
    LLMProvider,
    builder::{LLMBackend, LLMBuilder},
    chat::{ChatMessage, StreamChoice, StreamDelta, StreamResponse},
    error::LLMError,
};
use serde::{Deserialize, Serialize};

use crate::config::ChatConfig;
use crate::conversation::{Role, Turn};
use crate::error::{ConfigError, GenerationError, ModelLoadError};
use crate::prompt::Prompt;

/// sampling options forwarded to the engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationOptions {
    /// hard cap on output length, in tokens.
    pub max_new_tokens: u32,
    pub temperature: f32,
    /// `false` means greedy decoding.
    pub do_sample: bool,
    pub top_k: u32,
    pub top_p: f32,
    /// >= 1.0; discourages repeats.
    pub repetition_penalty: f32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            max_new_tokens: 200,
            temperature: 0.7,
            do_sample: true,
            top_k: 50,
            top_p: 0.9,
            repetition_penalty: 1.1,
        }
    }
}

impl GenerationOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_new_tokens == 0 {
            return Err(ConfigError::invalid("max_new_tokens", "must be at least 1"));
        }
        if self.temperature.is_nan() || self.temperature < 0.0 {
            return Err(ConfigError::invalid("temperature", format!("must be >= 0, got {}", self.temperature)));
        }
        if self.top_p.is_nan() || self.top_p <= 0.0 || self.top_p > 1.0 {
            return Err(ConfigError::invalid("top_p", format!("must be in (0, 1], got {}", self.top_p)));
        }
        if self.repetition_penalty.is_nan() || self.repetition_penalty < 1.0 {
            return Err(ConfigError::invalid(
                "repetition_penalty",
                format!("must be >= 1, got {}", self.repetition_penalty),
            ));
        }
        Ok(())
    }

    /// temperature actually sent to the engine; greedy decoding pins it to 0.
    pub fn effective_temperature(&self) -> f32 {
        if self.do_sample { self.temperature } else { 0.0 }
    }
}

/// one produced chunk (usually a single token).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Step {
    /// 1-based position in the generation.
    pub index: usize,
    pub text: String,
}

/// what the step callback wants the engine to do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepControl {
    Continue,
    Stop,
}

/// how a generation call settled.
#[derive(Clone, Debug, PartialEq)]
pub enum GenerationOutcome {
    /// raw engine output; may still carry an echoed prompt.
    Completed(String),
    /// the step callback asked to stop. `partial` is whatever streamed so far.
    Cancelled { partial: String },
    Failed(GenerationError),
}

/// a ready model.
///
/// engines that take raw text read `prompt.text`; chat endpoints that apply
/// the model's template themselves read `prompt.turns`.
///
/// `on_step` runs once per produced chunk. when it returns
/// [`StepControl::Stop`] the implementation must stop at that step and settle
/// as [`GenerationOutcome::Cancelled`], never as `Completed`.
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
pub trait InferenceClient: Send + Sync {
    async fn generate(
        &self,
        prompt: &Prompt,
        options: &GenerationOptions,
        on_step: &mut (dyn for<'s> FnMut(&'s Step) -> StepControl + Send),
    ) -> GenerationOutcome;
}

/// turns the startup configuration into a ready [`InferenceClient`].
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
pub trait ModelLoader: Send + Sync {
    async fn load(&self, config: &ChatConfig) -> Result<Arc<dyn InferenceClient>, ModelLoadError>;
}

// ---------------------- llm crate adapter ----------------------

/// [`ModelLoader`] backed by the `llm` crate's provider builder.
#[derive(Clone, Copy, Debug, Default)]
pub struct LlmLoader;

#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
impl ModelLoader for LlmLoader {
    async fn load(&self, config: &ChatConfig) -> Result<Arc<dyn InferenceClient>, ModelLoadError> {
        config.validate()?;
        let model = &config.model;
        let options = &config.generation;

        let backend: LLMBackend = model
            .backend
            .parse()
            .map_err(|err: LLMError| ModelLoadError::UnsupportedRuntime(err.to_string()))?;
        let model_id = model.resolved_model();
        info!(
            target: "bevy_drift_chat",
            "LlmLoader: backend='{}' model='{}' quantized={} key_present={}",
            model.backend, model_id, model.quantized, model.api_key.is_some()
        );

        if model.probe && matches!(backend, LLMBackend::Ollama) {
            let base = model.base_url.as_deref().unwrap_or(DEFAULT_OLLAMA_URL);
            probe_ollama(base, &model_id).await?;
        }

        if (options.repetition_penalty - 1.0).abs() > f32::EPSILON {
            debug!(
                target: "bevy_drift_chat",
                "repetition_penalty={} is not forwarded by the llm provider builder",
                options.repetition_penalty
            );
        }

        let mut b = LLMBuilder::new()
            .backend(backend)
            .model(model_id.clone())
            .max_tokens(options.max_new_tokens)
            .temperature(options.effective_temperature())
            .top_p(options.top_p)
            .top_k(options.top_k)
            .system(config.system_preamble.clone());
        if let Some(url) = &model.base_url {
            b = b.base_url(url.clone());
        }
        if let Some(key) = &model.api_key {
            b = b.api_key(key.clone());
        }
        let provider: Arc<dyn LLMProvider> = b
            .build()
            .map_err(|err| ModelLoadError::Init(err.to_string()))?
            .into();

        Ok(Arc::new(LlmClient::new(provider, options.max_new_tokens)))
    }
}

/// [`InferenceClient`] over a ready `llm` provider.
///
/// `llm` providers talk to chat endpoints that template server-side, so this
/// sends `prompt.turns` as structured messages. system turns are skipped: the
/// preamble is set on the provider at load.
///
/// `max_new_tokens` is also enforced here, one step per delta: not every
/// backend forwards `max_tokens` to its engine (ollama's chat endpoint doesn't).
#[derive(Clone)]
pub struct LlmClient {
    provider: Arc<dyn LLMProvider>,
    max_new_tokens: u32,
}

impl LlmClient {
    pub fn new(provider: Arc<dyn LLMProvider>, max_new_tokens: u32) -> Self {
        Self { provider, max_new_tokens }
    }
}

#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
impl InferenceClient for LlmClient {
    async fn generate(
        &self,
        prompt: &Prompt,
        options: &GenerationOptions,
        on_step: &mut (dyn for<'s> FnMut(&'s Step) -> StepControl + Send),
    ) -> GenerationOutcome {
        let messages = chat_messages(&prompt.turns);
        let cap = options.max_new_tokens.min(self.max_new_tokens) as usize;

        match self.provider.chat_stream_struct(&messages).await {
            Ok(s) => return consume_stream(s, cap, on_step).await,
            Err(err) => debug!(target: "bevy_drift_chat", "structured streaming unavailable: {err}"),
        }
        match self.provider.chat_stream(&messages).await {
            Ok(s) => return consume_deltas(s, cap, on_step).await,
            Err(err) => warn!(
                target: "bevy_drift_chat",
                "text streaming failed: {err}. falling back to one-shot chat()"
            ),
        }
        match self.provider.chat(&messages).await {
            Err(err) => {
                error!(target: "bevy_drift_chat", "chat error: {}", err);
                GenerationOutcome::Failed(err.into())
            }
            Ok(resp) => one_shot(&resp.text().unwrap_or_default(), cap, on_step).await,
        }
    }
}

fn chat_messages(turns: &[Turn]) -> Vec<ChatMessage> {
    turns
        .iter()
        .filter_map(|turn| match turn.role() {
            Role::User => Some(ChatMessage::user().content(turn.content()).build()),
            Role::Assistant => Some(ChatMessage::assistant().content(turn.content()).build()),
            Role::System => None,
        })
        .collect()
}

/// a reply that arrived whole, replayed one word (plus trailing whitespace) per
/// step so the chart, stop and the token cap behave as when streaming.
async fn one_shot(
    text: &str,
    cap: usize,
    on_step: &mut (dyn for<'s> FnMut(&'s Step) -> StepControl + Send),
) -> GenerationOutcome {
    let pieces = word_pieces(text).map(|piece| Ok::<_, LLMError>(piece.to_string()));
    consume_deltas(futures_lite::stream::iter(pieces), cap, on_step).await
}

fn word_pieces(text: &str) -> impl Iterator<Item = &str> {
    let mut rest = text;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let word_end = match rest.find(|c: char| !c.is_whitespace()) {
            Some(start) => rest[start..].find(char::is_whitespace).map_or(rest.len(), |i| start + i),
            None => rest.len(),
        };
        let end = rest[word_end..]
            .find(|c: char| !c.is_whitespace())
            .map_or(rest.len(), |i| word_end + i);
        let (piece, tail) = rest.split_at(end);
        rest = tail;
        Some(piece)
    })
}

/// drains a structured stream into steps, one per non-empty delta.
async fn consume_stream<S>(
    s: S,
    cap: usize,
    on_step: &mut (dyn for<'s> FnMut(&'s Step) -> StepControl + Send),
) -> GenerationOutcome
where
    S: Stream<Item = Result<StreamResponse, LLMError>> + Unpin,
{
    let deltas = s.map(|item| {
        item.map(|StreamResponse { choices, .. }| {
            choices
                .into_iter()
                .filter_map(|StreamChoice { delta: StreamDelta { content, .. } }| content)
                .collect::<String>()
        })
    });
    consume_deltas(deltas, cap, on_step).await
}

/// drains text deltas into steps, honoring `Stop` and the token cap.
async fn consume_deltas<S>(
    mut s: S,
    cap: usize,
    on_step: &mut (dyn for<'s> FnMut(&'s Step) -> StepControl + Send),
) -> GenerationOutcome
where
    S: Stream<Item = Result<String, LLMError>> + Unpin,
{
    let mut out = String::new();
    let mut index = 0usize;
    while let Some(item) = s.next().await {
        match item {
            Ok(txt) => {
                if txt.is_empty() {
                    continue;
                }
                index += 1;
                out.push_str(&txt);
                if on_step(&Step { index, text: txt }) == StepControl::Stop {
                    info!(target: "bevy_drift_chat", "generation stopped at step {}", index);
                    return GenerationOutcome::Cancelled { partial: out };
                }
                if index >= cap {
                    debug!(target: "bevy_drift_chat", "max_new_tokens={} reached", cap);
                    return GenerationOutcome::Completed(out);
                }
            }
            Err(err) => {
                error!(target: "bevy_drift_chat", "streaming error: {}", err);
                return GenerationOutcome::Failed(GenerationError::Stream(err.to_string()));
            }
        }
    }
    info!(target: "bevy_drift_chat", "stream completed: steps={} final_len={}", index, out.len());
    GenerationOutcome::Completed(out)
}

// ---------------------- ollama availability probe ----------------------

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

fn ollama_tags_url(base: &str) -> String {
    format!("{}/api/tags", base.trim_end_matches('/'))
}

async fn probe_ollama(base: &str, model: &str) -> Result<(), ModelLoadError> {
    let url = ollama_tags_url(base);
    info!(target: "bevy_drift_chat", "probing {}", url);
    let body = fetch_text(url).await?;
    let models = parse_ollama_models(&body)?;
    if models.iter().any(|m| ollama_model_matches(m, model)) {
        Ok(())
    } else {
        warn!(target: "bevy_drift_chat", "model '{}' not in backend list ({} models)", model, models.len());
        Err(ModelLoadError::ModelUnavailable { model: model.to_string() })
    }
}

/// ollama reports `name:latest` for untagged pulls.
fn ollama_model_matches(listed: &str, wanted: &str) -> bool {
    listed == wanted || (!wanted.contains(':') && listed == format!("{wanted}:latest"))
}

fn parse_ollama_models(text: &str) -> Result<Vec<String>, ModelLoadError> {
    // expect: { "models": [ { "name": "...", ... }, ... ] }
    let v: serde_json::Value =
        serde_json::from_str(text).map_err(|e| ModelLoadError::Fetch(format!("unexpected tags payload: {e}")))?;
    let mut out = Vec::new();
    if let Some(arr) = v.get("models").and_then(|d| d.as_array()) {
        for item in arr {
            if let Some(name) = item.get("name").and_then(|s| s.as_str()) {
                out.push(name.to_string());
            }
        }
    }
    Ok(out)
}

#[cfg(not(target_arch = "wasm32"))]
async fn fetch_text(url: String) -> Result<String, ModelLoadError> {
    // ureq is blocking; the load runs once, on a worker, before any chat
    let agent = ureq::Agent::new_with_defaults();
    let res = agent
        .get(&url)
        .header("accept", "application/json")
        .call()
        .map_err(|e| ModelLoadError::Fetch(e.to_string()))?;
    res.into_body()
        .read_to_string()
        .map_err(|e| ModelLoadError::Fetch(e.to_string()))
}

#[cfg(target_arch = "wasm32")]
async fn fetch_text(url: String) -> Result<String, ModelLoadError> {
    use gloo_net::http::Request;

    let resp = Request::get(&url)
        .header("accept", "application/json")
        .send()
        .await
        .map_err(|e| ModelLoadError::Fetch(e.to_string()))?;
    resp.text().await.map_err(|e| ModelLoadError::Fetch(e.to_string()))
}
