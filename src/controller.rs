//! chat lifecycle: loading, ready, one generation at a time.
//!
//! the controller owns the history and the single in-flight session, and talks
//! to the outside world only through a [`RenderSink`]. it never touches a
//! renderer or an engine directly, so the same type drives the bevy plugin and
//! plain async callers.
//!
//! every settled generation (completed, cancelled or failed) lands back in
//! [`ChatState::Ready`] with input enabled.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use bevy::log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::activity::activity_sample;
use crate::config::ChatConfig;
use crate::conversation::{ConversationHistory, Role, Turn};
use crate::error::ModelLoadError;
use crate::inference::{GenerationOptions, GenerationOutcome, InferenceClient, Step, StepControl};
use crate::prompt::{Prompt, PromptBuilder};

pub const PENDING_PLACEHOLDER: &str = "Thinking...";
pub const STOPPED_SUFFIX: &str = " [STOPPED]";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChatState {
    Idle,
    Loading,
    Ready,
    Generating,
    Error,
}

impl ChatState {
    /// text for the status indicator. generating keeps the online label; the
    /// disabled input is what signals it.
    pub fn label(&self) -> &'static str {
        match self {
            ChatState::Idle => "IDLE",
            ChatState::Loading => "Loading Model...",
            ChatState::Ready | ChatState::Generating => "ONLINE",
            ChatState::Error => "ERROR",
        }
    }

    /// srgb colour for the status indicator.
    pub fn color(&self) -> [u8; 3] {
        match self {
            ChatState::Idle => [0x00, 0xf0, 0xff],
            ChatState::Loading => [0xff, 0xaa, 0x00],
            ChatState::Ready | ChatState::Generating => [0x00, 0xff, 0x00],
            ChatState::Error => [0xff, 0x00, 0x00],
        }
    }
}

impl fmt::Display for ChatState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// handle to a transcript entry, issued by the sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub u64);

/// identifies one generation session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

/// where the controller sends everything user-visible.
pub trait RenderSink {
    fn append_turn(&mut self, role: Role, text: &str) -> EntryId;
    fn update_pending(&mut self, entry: EntryId, text: &str);
    fn push_sample(&mut self, sample: f32);
    fn set_status(&mut self, state: ChatState);
    fn set_input_enabled(&mut self, enabled: bool);
}

/// cloneable stop button for whichever session is active.
///
/// safe to trigger from anywhere, including while `ChatController::submit` is
/// awaiting. a stop with no active session is a no-op.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle {
    slot: Arc<Mutex<Option<CancellationToken>>>,
}

impl CancelHandle {
    /// returns whether a session was signalled.
    pub fn cancel(&self) -> bool {
        match self.lock().as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn arm(&self, token: CancellationToken) {
        *self.lock() = Some(token);
    }

    fn disarm(&self) {
        *self.lock() = None;
    }

    fn lock(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        // the slot only ever holds a token; a poisoned lock is still usable
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// everything needed to start the engine for one session.
#[derive(Clone, Debug)]
pub struct GenerationRequest {
    pub session: SessionId,
    pub prompt: Prompt,
    pub options: GenerationOptions,
    pub cancel: CancellationToken,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SettleKind {
    Completed,
    Cancelled,
    Failed,
}

/// summary of a settled session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settlement {
    pub session: SessionId,
    pub kind: SettleKind,
    pub tokens: usize,
    /// text left in the assistant entry.
    pub rendered: String,
}

#[derive(Debug)]
struct GenerationSession {
    id: SessionId,
    cancel: CancellationToken,
    tokens: usize,
    partial: String,
    prompt: String,
    pending: EntryId,
}

#[derive(Debug)]
pub struct ChatController {
    state: ChatState,
    history: ConversationHistory,
    prompt: PromptBuilder,
    options: GenerationOptions,
    context_turns: usize,
    greeting: Option<String>,
    session: Option<GenerationSession>,
    next_session: u64,
    cancel: CancelHandle,
}

impl Default for ChatController {
    fn default() -> Self {
        Self::from_config(&ChatConfig::default())
    }
}

impl ChatController {
    pub fn from_config(config: &ChatConfig) -> Self {
        Self {
            state: ChatState::Idle,
            history: ConversationHistory::new(),
            prompt: PromptBuilder::new(config.template, config.system_preamble.clone()),
            options: config.generation.clone(),
            context_turns: config.context_turns,
            greeting: config.greeting.clone(),
            session: None,
            next_session: 0,
            cancel: CancelHandle::default(),
        }
    }

    pub fn state(&self) -> ChatState {
        self.state
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    pub fn is_generating(&self) -> bool {
        self.session.is_some()
    }

    pub fn active_session(&self) -> Option<SessionId> {
        self.session.as_ref().map(|s| s.id)
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    fn transition<S: RenderSink + ?Sized>(&mut self, next: ChatState, sink: &mut S) {
        if self.state != next {
            debug!(target: "bevy_drift_chat", "state {:?} -> {:?}", self.state, next);
        }
        self.state = next;
        sink.set_status(next);
    }

    // ---------------------- model lifecycle ----------------------

    /// `Idle -> Loading`. also accepted from `Error`, as an explicit retry.
    pub fn start_loading<S: RenderSink + ?Sized>(&mut self, sink: &mut S) -> bool {
        if !matches!(self.state, ChatState::Idle | ChatState::Error) {
            warn!(target: "bevy_drift_chat", "start_loading ignored in state {:?}", self.state);
            return false;
        }
        info!(target: "bevy_drift_chat", "loading model");
        sink.set_input_enabled(false);
        self.transition(ChatState::Loading, sink);
        true
    }

    /// `Loading -> Ready`.
    pub fn model_ready<S: RenderSink + ?Sized>(&mut self, sink: &mut S) {
        if self.state != ChatState::Loading {
            warn!(target: "bevy_drift_chat", "model_ready ignored in state {:?}", self.state);
            return;
        }
        info!(target: "bevy_drift_chat", "model online");
        self.transition(ChatState::Ready, sink);
        sink.set_input_enabled(true);
        if let Some(greeting) = &self.greeting {
            sink.append_turn(Role::Assistant, greeting);
        }
    }

    /// `Loading -> Error`. input stays disabled.
    pub fn model_failed<S: RenderSink + ?Sized>(&mut self, err: &ModelLoadError, sink: &mut S) {
        if self.state != ChatState::Loading {
            warn!(target: "bevy_drift_chat", "model_failed ignored in state {:?}: {}", self.state, err);
            return;
        }
        error!(target: "bevy_drift_chat", "model load failed: {}", err);
        self.transition(ChatState::Error, sink);
        sink.set_input_enabled(false);
        sink.append_turn(Role::Assistant, &format!("Failed to load AI model. {err}"));
    }

    // ---------------------- generation ----------------------

    /// `Ready -> Generating`.
    ///
    /// `None` (and no side effects at all) for blank input, a model that isn't
    /// ready, or a session already in flight.
    pub fn begin<S: RenderSink + ?Sized>(&mut self, input: &str, sink: &mut S) -> Option<GenerationRequest> {
        let text = input.trim();
        if text.is_empty() {
            return None;
        }
        if self.state != ChatState::Ready || self.session.is_some() {
            debug!(target: "bevy_drift_chat", "submit ignored in state {:?}", self.state);
            return None;
        }

        // the tail is taken before the new turn lands so it isn't rendered twice
        let prompt = self.prompt.prepare(self.history.recent(self.context_turns), text);
        self.history.append(Turn::user(text));

        sink.append_turn(Role::User, text);
        let pending = sink.append_turn(Role::Assistant, PENDING_PLACEHOLDER);
        sink.set_input_enabled(false);
        self.transition(ChatState::Generating, sink);

        self.next_session += 1;
        let id = SessionId(self.next_session);
        let cancel = CancellationToken::new();
        self.cancel.arm(cancel.clone());
        info!(
            target: "bevy_drift_chat",
            "session {} started: input_len={} prompt_len={} history={}",
            id.0, text.len(), prompt.text.len(), self.history.len()
        );

        self.session = Some(GenerationSession {
            id,
            cancel: cancel.clone(),
            tokens: 0,
            partial: String::new(),
            prompt: prompt.text.clone(),
            pending,
        });

        Some(GenerationRequest { session: id, prompt, options: self.options.clone(), cancel })
    }

    /// one streamed chunk: grows the pending entry and feeds the chart.
    pub fn record_step<S: RenderSink + ?Sized>(&mut self, session: SessionId, step: &Step, sink: &mut S) {
        let Some(active) = self.session.as_mut().filter(|s| s.id == session) else {
            warn!(target: "bevy_drift_chat", "step for stale session {} dropped", session.0);
            return;
        };
        active.tokens += 1;
        active.partial.push_str(&step.text);
        sink.update_pending(active.pending, &active.partial);
        sink.push_sample(activity_sample(active.tokens, &step.text));
    }

    /// what the engine should do at the next step boundary.
    pub fn step_control(&self) -> StepControl {
        match &self.session {
            Some(s) if s.cancel.is_cancelled() => StepControl::Stop,
            _ => StepControl::Continue,
        }
    }

    /// cooperative stop; takes effect at the engine's next step.
    pub fn cancel(&self) -> bool {
        match &self.session {
            Some(s) => {
                info!(target: "bevy_drift_chat", "session {} cancel requested", s.id.0);
                s.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// `Generating -> Ready`, whatever the outcome.
    ///
    /// only a completed generation adds an assistant turn to the history.
    pub fn finish<S: RenderSink + ?Sized>(
        &mut self,
        session: SessionId,
        outcome: GenerationOutcome,
        sink: &mut S,
    ) -> Option<Settlement> {
        if self.active_session() != Some(session) {
            warn!(target: "bevy_drift_chat", "settlement for stale session {} ignored", session.0);
            return None;
        }
        let active = self.session.take()?;
        self.cancel.disarm();

        let (kind, rendered) = match outcome {
            GenerationOutcome::Completed(raw) => {
                let reply = self.prompt.extract_reply(&active.prompt, &raw);
                self.history.append(Turn::assistant(reply.clone()));
                info!(
                    target: "bevy_drift_chat",
                    "session {} completed: tokens={} reply_len={}",
                    session.0, active.tokens, reply.len()
                );
                (SettleKind::Completed, reply)
            }
            GenerationOutcome::Cancelled { partial } => {
                let source = if partial.is_empty() { &active.partial } else { &partial };
                let partial = self.prompt.extract_reply(&active.prompt, source);
                let shown = if partial.is_empty() { PENDING_PLACEHOLDER } else { partial.as_str() };
                info!(target: "bevy_drift_chat", "session {} stopped after {} tokens", session.0, active.tokens);
                (SettleKind::Cancelled, format!("{shown}{STOPPED_SUFFIX}"))
            }
            GenerationOutcome::Failed(err) => {
                error!(target: "bevy_drift_chat", "session {} failed: {}", session.0, err);
                (SettleKind::Failed, format!("Error: {err}"))
            }
        };

        sink.update_pending(active.pending, &rendered);
        self.transition(ChatState::Ready, sink);
        sink.set_input_enabled(true);

        Some(Settlement { session, kind, tokens: active.tokens, rendered })
    }

    /// full round trip against `client`: begin, stream, finish.
    ///
    /// `None` when the submit was ignored (see [`ChatController::begin`]).
    pub async fn submit<S>(&mut self, input: &str, client: &dyn InferenceClient, sink: &mut S) -> Option<Settlement>
    where
        S: RenderSink + Send,
    {
        let request = self.begin(input, sink)?;
        let session = request.session;
        let outcome = {
            let mut on_step = |step: &Step| {
                self.record_step(session, step, sink);
                self.step_control()
            };
            client.generate(&request.prompt, &request.options, &mut on_step).await
        };
        self.finish(session, outcome, sink)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::activity::MAX_SAMPLE;
    use crate::error::GenerationError;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    pub enum Op {
        Append(EntryId, Role, String),
        Update(EntryId, String),
        Sample(f32),
        Status(ChatState),
        Input(bool),
    }

    #[derive(Debug, Default)]
    pub struct RecordingSink {
        pub ops: Vec<Op>,
        next: u64,
    }

    impl RecordingSink {
        pub fn entries(&self) -> Vec<(Role, String)> {
            let mut out: Vec<(EntryId, Role, String)> = Vec::new();
            for op in &self.ops {
                match op {
                    Op::Append(id, role, text) => out.push((*id, *role, text.clone())),
                    Op::Update(id, text) => {
                        if let Some(e) = out.iter_mut().find(|e| e.0 == *id) {
                            e.2 = text.clone();
                        }
                    }
                    _ => {}
                }
            }
            out.into_iter().map(|(_, r, t)| (r, t)).collect()
        }

        pub fn input_enabled(&self) -> Option<bool> {
            self.ops.iter().rev().find_map(|op| match op {
                Op::Input(b) => Some(*b),
                _ => None,
            })
        }

        pub fn samples(&self) -> Vec<f32> {
            self.ops
                .iter()
                .filter_map(|op| match op {
                    Op::Sample(v) => Some(*v),
                    _ => None,
                })
                .collect()
        }
    }

    impl RenderSink for RecordingSink {
        fn append_turn(&mut self, role: Role, text: &str) -> EntryId {
            self.next += 1;
            let id = EntryId(self.next);
            self.ops.push(Op::Append(id, role, text.to_string()));
            id
        }
        fn update_pending(&mut self, entry: EntryId, text: &str) {
            self.ops.push(Op::Update(entry, text.to_string()));
        }
        fn push_sample(&mut self, sample: f32) {
            self.ops.push(Op::Sample(sample));
        }
        fn set_status(&mut self, state: ChatState) {
            self.ops.push(Op::Status(state));
        }
        fn set_input_enabled(&mut self, enabled: bool) {
            self.ops.push(Op::Input(enabled));
        }
    }

    /// streams `chunks`, then settles per `ending`.
    pub struct ScriptedClient {
        pub chunks: Vec<&'static str>,
        pub ending: Option<GenerationError>,
        pub echo_prompt: bool,
        pub calls: AtomicUsize,
        /// trigger this handle after the given number of steps.
        pub stop_after: Option<(usize, CancelHandle)>,
    }

    impl ScriptedClient {
        pub fn replying(chunks: Vec<&'static str>) -> Self {
            Self { chunks, ending: None, echo_prompt: false, calls: AtomicUsize::new(0), stop_after: None }
        }
    }

    #[async_trait]
    impl InferenceClient for ScriptedClient {
        async fn generate(
            &self,
            prompt: &Prompt,
            _options: &GenerationOptions,
            on_step: &mut (dyn for<'s> FnMut(&'s Step) -> StepControl + Send),
        ) -> GenerationOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut out = if self.echo_prompt { prompt.text.clone() } else { String::new() };
            let mut streamed = String::new();
            for (i, chunk) in self.chunks.iter().enumerate() {
                if let Some((n, handle)) = &self.stop_after
                    && i == *n
                {
                    handle.cancel();
                }
                out.push_str(chunk);
                streamed.push_str(chunk);
                if on_step(&Step { index: i + 1, text: chunk.to_string() }) == StepControl::Stop {
                    return GenerationOutcome::Cancelled { partial: streamed };
                }
            }
            match &self.ending {
                Some(err) => GenerationOutcome::Failed(err.clone()),
                None => GenerationOutcome::Completed(out),
            }
        }
    }

    fn ready_controller(sink: &mut RecordingSink) -> ChatController {
        let mut c = ChatController::default();
        assert!(c.start_loading(sink));
        c.model_ready(sink);
        assert_eq!(c.state(), ChatState::Ready);
        sink.ops.clear();
        c
    }

    #[test]
    fn load_success_goes_online_with_greeting() {
        let mut sink = RecordingSink::default();
        let mut c = ChatController::default();
        assert_eq!(c.state(), ChatState::Idle);

        c.start_loading(&mut sink);
        assert_eq!(c.state(), ChatState::Loading);
        assert_eq!(sink.input_enabled(), Some(false));

        c.model_ready(&mut sink);
        assert_eq!(c.state(), ChatState::Ready);
        assert_eq!(c.state().label(), "ONLINE");
        assert_eq!(sink.input_enabled(), Some(true));
        assert_eq!(
            sink.entries(),
            vec![(Role::Assistant, "DeepDrift node online. Neural link established.".to_string())]
        );
        assert!(c.history().is_empty(), "greeting is not a turn");
    }

    #[test]
    fn load_failure_blocks_generation() {
        let mut sink = RecordingSink::default();
        let mut c = ChatController::default();
        c.start_loading(&mut sink);
        c.model_failed(&ModelLoadError::UnsupportedRuntime("no compute backend".into()), &mut sink);

        assert_eq!(c.state(), ChatState::Error);
        assert_eq!(c.state().label(), "ERROR");
        assert_eq!(sink.input_enabled(), Some(false));
        assert!(sink.entries()[0].1.starts_with("Failed to load AI model."));

        assert!(c.begin("Hello", &mut sink).is_none());
        assert!(c.history().is_empty());
        assert_eq!(c.state(), ChatState::Error);
    }

    #[test]
    fn blank_input_is_a_no_op() {
        let mut sink = RecordingSink::default();
        let mut c = ready_controller(&mut sink);
        for input in ["", "   ", "\n\t "] {
            assert!(c.begin(input, &mut sink).is_none());
        }
        assert!(c.history().is_empty());
        assert!(sink.ops.is_empty());
        assert_eq!(c.state(), ChatState::Ready);
    }

    #[test]
    fn submit_while_generating_is_a_no_op() {
        let mut sink = RecordingSink::default();
        let mut c = ready_controller(&mut sink);
        let first = c.begin("Hello", &mut sink).expect("first submit");
        let ops_before = sink.ops.len();

        assert!(c.begin("again", &mut sink).is_none());
        assert_eq!(c.history().len(), 1);
        assert_eq!(sink.ops.len(), ops_before);
        assert_eq!(c.active_session(), Some(first.session));
    }

    #[test]
    fn prompt_uses_prior_history_only() {
        let mut sink = RecordingSink::default();
        let mut c = ready_controller(&mut sink);
        let req = c.begin("Hello", &mut sink).unwrap();
        assert_eq!(req.prompt.text.matches("Hello").count(), 1);
        assert!(req.prompt.text.ends_with("<|im_start|>user\nHello<|im_end|>\n<|im_start|>assistant\n"));
    }

    #[test]
    fn prompt_carries_at_most_three_prior_turns() {
        let client = ScriptedClient::replying(vec!["ok"]);
        let mut sink = RecordingSink::default();
        let mut c = ready_controller(&mut sink);
        for msg in ["one", "two", "three"] {
            pollster::block_on(c.submit(msg, &client, &mut sink)).unwrap();
        }
        assert_eq!(c.history().len(), 6);

        let req = c.begin("four", &mut sink).unwrap();
        // tail is [ok, user three, ok]
        assert!(!req.prompt.text.contains("two"));
        assert!(req.prompt.text.contains("three"));
        assert_eq!(req.prompt.text.matches("<|im_start|>").count(), 1 + 3 + 1 + 1);
        assert_eq!(req.prompt.turns.len(), 1 + 3 + 1);
    }

    #[test]
    fn completed_generation_appends_reply() {
        let client = ScriptedClient::replying(vec!["Hi", " there"]);
        let mut sink = RecordingSink::default();
        let mut c = ready_controller(&mut sink);

        let settled = pollster::block_on(c.submit("Hello", &client, &mut sink)).unwrap();
        assert_eq!(settled.kind, SettleKind::Completed);
        assert_eq!(settled.tokens, 2);

        assert_eq!(
            sink.entries(),
            vec![(Role::User, "Hello".to_string()), (Role::Assistant, "Hi there".to_string())]
        );
        let turns: Vec<_> = c.history().iter().cloned().collect();
        assert_eq!(turns, vec![Turn::user("Hello"), Turn::assistant("Hi there")]);
        assert_eq!(c.state(), ChatState::Ready);
        assert_eq!(sink.input_enabled(), Some(true));
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn echoed_prompt_is_stripped() {
        let mut client = ScriptedClient::replying(vec!["Hi there", "<|im_end|>"]);
        client.echo_prompt = true;
        let mut sink = RecordingSink::default();
        let mut c = ready_controller(&mut sink);

        let settled = pollster::block_on(c.submit("Hello", &client, &mut sink)).unwrap();
        assert_eq!(settled.rendered, "Hi there");
        assert_eq!(c.history().last(), Some(&Turn::assistant("Hi there")));
    }

    #[test]
    fn cancellation_annotates_and_keeps_history_clean() {
        let mut sink = RecordingSink::default();
        let mut c = ready_controller(&mut sink);
        let mut client = ScriptedClient::replying(vec!["Once", " upon", " a", " time"]);
        client.stop_after = Some((2, c.cancel_handle()));

        let settled = pollster::block_on(c.submit("story?", &client, &mut sink)).unwrap();
        assert_eq!(settled.kind, SettleKind::Cancelled);
        assert_eq!(settled.rendered, "Once upon a [STOPPED]");
        assert_eq!(sink.entries()[1], (Role::Assistant, "Once upon a [STOPPED]".to_string()));

        assert_eq!(c.history().len(), 1, "only the user turn");
        assert_eq!(c.history().last().map(Turn::role), Some(Role::User));
        assert_eq!(c.state(), ChatState::Ready);
        assert_eq!(sink.input_enabled(), Some(true));
    }

    #[test]
    fn cancel_before_any_token_shows_placeholder() {
        let mut sink = RecordingSink::default();
        let mut c = ready_controller(&mut sink);
        let req = c.begin("Hello", &mut sink).unwrap();
        assert!(c.cancel());
        assert_eq!(c.step_control(), StepControl::Stop);
        assert!(req.cancel.is_cancelled());

        let settled = c
            .finish(req.session, GenerationOutcome::Cancelled { partial: String::new() }, &mut sink)
            .unwrap();
        assert_eq!(settled.rendered, "Thinking... [STOPPED]");
    }

    #[test]
    fn failure_renders_error_and_recovers() {
        let mut client = ScriptedClient::replying(vec!["par"]);
        client.ending = Some(GenerationError::Stream("connection reset".into()));
        let mut sink = RecordingSink::default();
        let mut c = ready_controller(&mut sink);

        let settled = pollster::block_on(c.submit("Hello", &client, &mut sink)).unwrap();
        assert_eq!(settled.kind, SettleKind::Failed);
        assert_eq!(sink.entries()[1].1, "Error: stream error: connection reset");
        assert_eq!(c.history().len(), 1);
        assert_eq!(c.state(), ChatState::Ready);
        assert_eq!(sink.input_enabled(), Some(true));

        // and the next submit goes through
        let ok = ScriptedClient::replying(vec!["fine"]);
        assert!(pollster::block_on(c.submit("again", &ok, &mut sink)).is_some());
    }

    #[test]
    fn stale_settlements_and_steps_are_ignored() {
        let mut sink = RecordingSink::default();
        let mut c = ready_controller(&mut sink);
        let req = c.begin("Hello", &mut sink).unwrap();
        let stale = SessionId(req.session.0 + 7);

        c.record_step(stale, &Step { index: 1, text: "x".into() }, &mut sink);
        assert!(sink.samples().is_empty());
        assert!(c.finish(stale, GenerationOutcome::Completed("x".into()), &mut sink).is_none());
        assert_eq!(c.state(), ChatState::Generating);

        c.finish(req.session, GenerationOutcome::Completed("ok".into()), &mut sink).unwrap();
        assert!(c.finish(req.session, GenerationOutcome::Completed("again".into()), &mut sink).is_none());
        assert_eq!(c.history().len(), 2);
    }

    #[test]
    fn every_step_feeds_the_chart() {
        let client = ScriptedClient::replying(vec!["a"; 12]);
        let mut sink = RecordingSink::default();
        let mut c = ready_controller(&mut sink);
        pollster::block_on(c.submit("go", &client, &mut sink)).unwrap();

        let samples = sink.samples();
        assert_eq!(samples.len(), 12);
        assert!(samples.iter().all(|v| (0.0..=MAX_SAMPLE).contains(v)));
        assert_eq!(samples[9], 0.0, "ramp wraps at the tenth token");
    }

    #[test]
    fn cancel_handle_without_session_is_a_no_op() {
        let mut sink = RecordingSink::default();
        let c = ready_controller(&mut sink);
        assert!(!c.cancel_handle().cancel());
        assert!(!c.cancel());
    }
}
