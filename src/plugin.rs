//! bevy wiring: resources, events and async tasks around [`ChatController`].
//!
//! - the model loads once at `Startup`; its result comes back through the inbox.
//! - each submit spawns one generation task. the task's step callback forwards
//!   steps to the inbox and reads the session's cancellation token, so a stop
//!   lands at the next step boundary.
//! - the controller renders into [`TranscriptQueue`], which fans out to
//!   [`TranscriptEvt`] / [`StatusEvt`] and the [`ActivityChart`] once per frame.
//! - never blocks the main thread: on native we hand tasks to a tiny tokio
//!   runtime; on wasm we use bevy's async pool, which yields to the browser.

use std::sync::Arc;

use bevy::prelude::*;
use bevy::tasks::AsyncComputeTaskPool;
use bevy::window::WindowOccluded;
use flume::{Receiver, Sender, TryRecvError};

use crate::activity::{ActivityFrame, ActivityWindow};
use crate::config::ChatConfig;
use crate::controller::{ChatController, ChatState, EntryId, GenerationRequest, RenderSink, SessionId};
use crate::conversation::Role;
use crate::error::{GenerationError, ModelLoadError};
use crate::inference::{GenerationOutcome, InferenceClient, LlmLoader, ModelLoader, Step, StepControl};

/// the chat controller as a resource. built from [`ChatConfig`] when the plugin
/// is added.
#[derive(Resource, Debug)]
pub struct Chat(pub ChatController);

/// the ready model, once loading succeeded.
#[derive(Resource, Default, Clone)]
pub struct ActiveClient(pub Option<Arc<dyn InferenceClient>>);

/// how the model gets loaded. defaults to [`LlmLoader`]; insert your own before
/// adding the plugin to swap engines.
#[derive(Resource, Clone)]
pub struct ModelBackend(pub Arc<dyn ModelLoader>);

impl Default for ModelBackend {
    fn default() -> Self {
        Self(Arc::new(LlmLoader))
    }
}

/// activity series backing the chart.
#[derive(Resource, Default, Debug)]
pub struct ActivityChart(pub ActivityWindow);

/// on native we keep a tiny tokio runtime to drive inference futures.
/// we spawn onto this rt from compute tasks so neither the main thread
/// nor bevy's compute pools block.
#[cfg(not(target_arch = "wasm32"))]
#[derive(Resource, Clone)]
pub struct TokioRt(pub Arc<tokio::runtime::Runtime>);

#[cfg(not(target_arch = "wasm32"))]
impl Default for TokioRt {
    fn default() -> Self {
        info!(target: "bevy_drift_chat", "DriftChat: initializing Tokio multi-thread runtime (native)");
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .expect("tokio runtime");
        Self(Arc::new(rt))
    }
}

/// system ordering so uis can run after we emit events
#[derive(SystemSet, Debug, Hash, PartialEq, Eq, Clone)]
pub enum ChatSet {
    /// submit/cancel handling, inbox drain and render fan-out (in `Update`)
    Drain,
}

// ---------------------- events ----------------------

/// ask for a reply to `0`. ignored unless the chat is ready and idle.
#[derive(Event, Debug, Clone)]
pub struct SubmitPrompt(pub String);

/// stop the in-flight generation at its next step.
#[derive(Event, Debug, Clone, Copy, Default)]
pub struct CancelGeneration;

#[derive(Event, Debug, Clone, PartialEq)]
pub enum TranscriptEvt {
    Appended { entry: EntryId, role: Role, text: String },
    /// replaces the entry's whole text.
    Updated { entry: EntryId, text: String },
}

/// latest status, emitted whenever state or input availability changed.
#[derive(Event, Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusEvt {
    pub state: ChatState,
    pub input_enabled: bool,
}

/// the chart changed and the surface is visible.
#[derive(Event, Debug, Clone, PartialEq)]
pub struct ActivityRedrawEvt(pub ActivityFrame);

// ---------------------- render sink ----------------------

#[derive(Debug, Clone, PartialEq)]
enum RenderOp {
    Append { entry: EntryId, role: Role, text: String },
    Update { entry: EntryId, text: String },
    Sample(f32),
}

/// [`RenderSink`] that buffers controller output until `flush_transcript`
/// turns it into events.
#[derive(Resource, Debug)]
pub struct TranscriptQueue {
    ops: Vec<RenderOp>,
    next_entry: u64,
    state: ChatState,
    input_enabled: bool,
    status_dirty: bool,
}

impl Default for TranscriptQueue {
    fn default() -> Self {
        Self {
            ops: Vec::new(),
            next_entry: 0,
            state: ChatState::Idle,
            input_enabled: false,
            status_dirty: false,
        }
    }
}

impl TranscriptQueue {
    pub fn state(&self) -> ChatState {
        self.state
    }

    pub fn input_enabled(&self) -> bool {
        self.input_enabled
    }
}

impl RenderSink for TranscriptQueue {
    fn append_turn(&mut self, role: Role, text: &str) -> EntryId {
        self.next_entry += 1;
        let entry = EntryId(self.next_entry);
        self.ops.push(RenderOp::Append { entry, role, text: text.to_string() });
        entry
    }

    fn update_pending(&mut self, entry: EntryId, text: &str) {
        // consecutive updates to one entry collapse into the latest
        if let Some(RenderOp::Update { entry: last, text: prev }) = self.ops.last_mut()
            && *last == entry
        {
            prev.clear();
            prev.push_str(text);
            return;
        }
        self.ops.push(RenderOp::Update { entry, text: text.to_string() });
    }

    fn push_sample(&mut self, sample: f32) {
        self.ops.push(RenderOp::Sample(sample));
    }

    fn set_status(&mut self, state: ChatState) {
        self.status_dirty |= self.state != state;
        self.state = state;
    }

    fn set_input_enabled(&mut self, enabled: bool) {
        self.status_dirty |= self.input_enabled != enabled;
        self.input_enabled = enabled;
    }
}

// ---------------------- inbox ----------------------

/// cross-thread inbox; task producers send, the main thread drains.
/// unbounded so a stalled frame never drops a step or a settlement; a session
/// produces at most `max_new_tokens` steps.
#[derive(Resource, Clone)]
struct StreamInbox {
    tx: Sender<StreamMsg>,
    rx: Receiver<StreamMsg>,
}

impl Default for StreamInbox {
    fn default() -> Self {
        let (tx, rx) = flume::unbounded();
        Self { tx, rx }
    }
}

enum StreamMsg {
    Loaded(Result<Arc<dyn InferenceClient>, ModelLoadError>),
    Step { session: SessionId, step: Step },
    Settled { session: SessionId, outcome: GenerationOutcome },
}

/// send to inbox (ignore disconnected)
fn push_inbox(tx: &Sender<StreamMsg>, msg: StreamMsg) {
    let _ = tx.send(msg);
}

/// reports a settlement for its session exactly once. if the task is dropped
/// before settling, the drop reports a failure so the controller never stays
/// stuck in `Generating`.
struct SettleGuard {
    tx: Sender<StreamMsg>,
    session: SessionId,
    settled: bool,
}

impl SettleGuard {
    fn new(tx: Sender<StreamMsg>, session: SessionId) -> Self {
        Self { tx, session, settled: false }
    }

    fn settle(mut self, outcome: GenerationOutcome) {
        self.settled = true;
        push_inbox(&self.tx, StreamMsg::Settled { session: self.session, outcome });
    }
}

impl Drop for SettleGuard {
    fn drop(&mut self) {
        if !self.settled {
            warn!(target: "bevy_drift_chat", "generation task for session {} dropped before settling", self.session.0);
            let outcome = GenerationOutcome::Failed(GenerationError::Task("generation task dropped".into()));
            push_inbox(&self.tx, StreamMsg::Settled { session: self.session, outcome });
        }
    }
}

// ---------------------- plugin ----------------------

/// bevy plugin: wires systems, events, resources.
///
/// insert a [`ChatConfig`] (and optionally a [`ModelBackend`]) before adding
/// the plugin to override the defaults. on native, also inserts a tiny tokio
/// runtime resource by default.
pub struct DriftChatPlugin;

impl Plugin for DriftChatPlugin {
    fn build(&self, app: &mut App) {
        info!(target: "bevy_drift_chat", "DriftChatPlugin: build()");
        if !app.world().contains_resource::<ChatConfig>() {
            app.insert_resource(ChatConfig::default());
        }
        if !app.world().contains_resource::<ModelBackend>() {
            app.insert_resource(ModelBackend::default());
        }
        let controller = ChatController::from_config(app.world().resource::<ChatConfig>());

        app.insert_resource(Chat(controller))
            .init_resource::<StreamInbox>()
            .init_resource::<ActiveClient>()
            .init_resource::<TranscriptQueue>()
            .init_resource::<ActivityChart>()
            .add_event::<SubmitPrompt>()
            .add_event::<CancelGeneration>()
            .add_event::<TranscriptEvt>()
            .add_event::<StatusEvt>()
            .add_event::<ActivityRedrawEvt>()
            .add_event::<WindowOccluded>()
            .configure_sets(Update, ChatSet::Drain)
            .add_systems(Startup, start_model_load)
            .add_systems(
                Update,
                (
                    handle_cancel,
                    handle_submit,
                    drain_stream_inbox,
                    track_window_occlusion,
                    flush_transcript,
                    emit_activity_redraw,
                )
                    .chain()
                    .in_set(ChatSet::Drain),
            );

        #[cfg(target_arch = "wasm32")]
        app.add_systems(
            Update,
            poll_document_visibility
                .after(track_window_occlusion)
                .before(emit_activity_redraw)
                .in_set(ChatSet::Drain),
        );

        #[cfg(not(target_arch = "wasm32"))]
        if app.world().get_resource::<TokioRt>().is_none() {
            app.insert_resource(TokioRt::default());
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn spawn_detached<F>(rt: &TokioRt, run: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    // native: hand off to tokio so bevy pools stay free.
    let rt = rt.0.clone();
    AsyncComputeTaskPool::get()
        .spawn(async move {
            let _ = rt.spawn(run).await;
        })
        .detach();
}

#[cfg(target_arch = "wasm32")]
fn spawn_detached<F>(run: F)
where
    F: Future<Output = ()> + 'static,
{
    // wasm path: just await directly (no tokio).
    AsyncComputeTaskPool::get().spawn(run).detach();
}

/// kicks off the one-time model load.
fn start_model_load(
    mut chat: ResMut<Chat>,
    mut queue: ResMut<TranscriptQueue>,
    config: Res<ChatConfig>,
    backend: Res<ModelBackend>,
    inbox: Res<StreamInbox>,

    // native-only: small runtime to drive the loader
    #[cfg(not(target_arch = "wasm32"))] rt: Res<TokioRt>,
) {
    if !chat.0.start_loading(&mut *queue) {
        return;
    }
    let loader = backend.0.clone();
    let config = (*config).clone();
    let tx = inbox.tx.clone();
    info!(
        target: "bevy_drift_chat",
        "start_model_load: backend='{}' model='{}'", config.model.backend, config.model.model
    );

    let run = async move {
        let result = loader.load(&config).await;
        push_inbox(&tx, StreamMsg::Loaded(result));
    };

    #[cfg(not(target_arch = "wasm32"))]
    spawn_detached(&rt, run);
    #[cfg(target_arch = "wasm32")]
    spawn_detached(run);
}

fn handle_cancel(mut ev: EventReader<CancelGeneration>, chat: Res<Chat>) {
    for _ in ev.read() {
        if !chat.0.cancel() {
            debug!(target: "bevy_drift_chat", "cancel with no generation in flight");
        }
    }
}

/// turns accepted submits into generation tasks.
fn handle_submit(
    mut ev: EventReader<SubmitPrompt>,
    mut chat: ResMut<Chat>,
    mut queue: ResMut<TranscriptQueue>,
    client: Res<ActiveClient>,
    inbox: Res<StreamInbox>,

    #[cfg(not(target_arch = "wasm32"))] rt: Res<TokioRt>,
) {
    for SubmitPrompt(text) in ev.read() {
        let Some(client) = client.0.clone() else {
            debug!(target: "bevy_drift_chat", "submit ignored: no model loaded");
            continue;
        };
        let Some(request) = chat.0.begin(text, &mut *queue) else {
            continue;
        };
        let run = run_generation(client, request, inbox.tx.clone());

        #[cfg(not(target_arch = "wasm32"))]
        spawn_detached(&rt, run);
        #[cfg(target_arch = "wasm32")]
        spawn_detached(run);
    }
}

async fn run_generation(client: Arc<dyn InferenceClient>, request: GenerationRequest, tx: Sender<StreamMsg>) {
    let GenerationRequest { session, prompt, options, cancel } = request;
    let guard = SettleGuard::new(tx.clone(), session);

    let mut on_step = move |step: &Step| {
        push_inbox(&tx, StreamMsg::Step { session, step: step.clone() });
        if cancel.is_cancelled() { StepControl::Stop } else { StepControl::Continue }
    };
    let outcome = client.generate(&prompt, &options, &mut on_step).await;
    guard.settle(outcome);
}

/// drains the inbox into the controller.
fn drain_stream_inbox(
    inbox: Res<StreamInbox>,
    mut chat: ResMut<Chat>,
    mut queue: ResMut<TranscriptQueue>,
    mut client: ResMut<ActiveClient>,
) {
    // drain up to a cap per frame to avoid long frames on bursty streams
    const MAX_PER_FRAME: usize = 512;
    for _ in 0..MAX_PER_FRAME {
        let msg = match inbox.rx.try_recv() {
            Ok(m) => m,
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
        };
        match msg {
            StreamMsg::Loaded(Ok(ready)) => {
                client.0 = Some(ready);
                chat.0.model_ready(&mut *queue);
            }
            StreamMsg::Loaded(Err(err)) => chat.0.model_failed(&err, &mut *queue),
            StreamMsg::Step { session, step } => chat.0.record_step(session, &step, &mut *queue),
            StreamMsg::Settled { session, outcome } => {
                chat.0.finish(session, outcome, &mut *queue);
            }
        }
    }
}

/// redraws are skipped while the window is occluded (minimized, hidden tab).
fn track_window_occlusion(mut ev: EventReader<WindowOccluded>, mut chart: ResMut<ActivityChart>) {
    for WindowOccluded { occluded, .. } in ev.read() {
        debug!(target: "bevy_drift_chat", "surface occluded={}", occluded);
        chart.0.set_visible(!occluded);
    }
}

#[cfg(target_arch = "wasm32")]
fn poll_document_visibility(mut chart: ResMut<ActivityChart>) {
    let hidden = web_sys::window()
        .and_then(|w| w.document())
        .map(|d| d.hidden())
        .unwrap_or(false);
    if chart.0.visible() == hidden {
        chart.0.set_visible(!hidden);
    }
}

/// fans queued controller output out to events and the chart.
fn flush_transcript(
    mut queue: ResMut<TranscriptQueue>,
    mut chart: ResMut<ActivityChart>,
    mut ev_transcript: EventWriter<TranscriptEvt>,
    mut ev_status: EventWriter<StatusEvt>,
) {
    if queue.status_dirty {
        queue.status_dirty = false;
        ev_status.write(StatusEvt { state: queue.state, input_enabled: queue.input_enabled });
    }
    if queue.ops.is_empty() {
        return;
    }
    for op in std::mem::take(&mut queue.ops) {
        match op {
            RenderOp::Append { entry, role, text } => {
                ev_transcript.write(TranscriptEvt::Appended { entry, role, text });
            }
            RenderOp::Update { entry, text } => {
                ev_transcript.write(TranscriptEvt::Updated { entry, text });
            }
            RenderOp::Sample(v) => chart.0.push(v),
        }
    }
}

fn emit_activity_redraw(mut chart: ResMut<ActivityChart>, mut ev: EventWriter<ActivityRedrawEvt>) {
    if let Some(frame) = chart.0.take_redraw() {
        ev.write(ActivityRedrawEvt(frame));
    }
}
