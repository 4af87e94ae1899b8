//! bevy_drift_chat: a streaming chat client plugin with a live activity chart.
//!
//! - keeps the conversation in memory and renders model-specific prompts.
//! - streams generation steps from an engine behind [`InferenceClient`]; the
//!   default adapter wraps the `llm` crate.
//! - one generation at a time, cooperatively cancellable at step boundaries.
//! - feeds a 60-sample rolling "activity" series, paused while the window is
//!   hidden.
//! - never blocks the main thread: on native we spawn onto a tiny tokio
//!   runtime; on wasm we use bevy's async pool, which yields to the browser.
//!
//! the controller ([`ChatController`]) is plain rust and renders through the
//! [`RenderSink`] trait; [`DriftChatPlugin`] binds it to bevy resources and
//! events.

pub mod activity;
pub mod config;
pub mod controller;
pub mod conversation;
pub mod error;
pub mod inference;
pub mod plugin;
pub mod prompt;

pub use activity::{ActivityFrame, ActivityWindow, SeriesColors, activity_sample};
pub use config::{ChatConfig, ModelConfig};
pub use controller::{
    CancelHandle, ChatController, ChatState, EntryId, GenerationRequest, RenderSink, SessionId, SettleKind,
    Settlement,
};
pub use conversation::{ConversationHistory, Role, Turn};
pub use error::{ConfigError, GenerationError, ModelLoadError};
pub use inference::{
    GenerationOptions, GenerationOutcome, InferenceClient, LlmClient, LlmLoader, ModelLoader, Step, StepControl,
};
pub use plugin::{
    ActiveClient, ActivityChart, ActivityRedrawEvt, CancelGeneration, Chat, ChatSet, DriftChatPlugin, ModelBackend,
    StatusEvt, SubmitPrompt, TranscriptEvt, TranscriptQueue,
};
pub use prompt::{ChatTemplate, Prompt, PromptBuilder};

#[cfg(not(target_arch = "wasm32"))]
pub use plugin::TokioRt;
