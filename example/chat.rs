//! bevy_drift_chat demo: transcript, status light, activity chart, prompt line.
//! - enter sends, escape stops the running generation (or use the buttons).
//! - the model loads once at startup; see `ChatConfig` for the knobs.
//!
//! env:
//!   DRIFT_CONFIG     (optional json file, see `ChatConfig`)
//!   DRIFT_BACKEND    (default ollama)
//!   DRIFT_MODEL      (default qwen2.5:0.5b-instruct)
//!   DRIFT_BASE_URL / LLM_BASE_URL
//!   DRIFT_API_KEY / OPENAI_API_KEY
//!   DRIFT_QUANTIZED  (default true)

use bevy::input::keyboard::{KeyCode, KeyboardInput};
use bevy::prelude::*;
use bevy_drift_chat::{
    ActivityRedrawEvt, CancelGeneration, ChatConfig, ChatSet, ChatState, DriftChatPlugin, EntryId, Role,
    SeriesColors, StatusEvt, SubmitPrompt, TranscriptEvt, activity::WINDOW_LEN,
};

// ---------------------- ui tags ----------------------

#[derive(Component)]
struct StatusText;
#[derive(Component)]
struct TranscriptList;
#[derive(Component)]
struct TranscriptLine(EntryId);
#[derive(Component)]
struct ChartPanel;
#[derive(Component)]
struct ChartBar(usize);
#[derive(Component)]
struct PromptText;
#[derive(Component)]
struct BtnSend;
#[derive(Component)]
struct BtnStop;

// ---------------------- app state ----------------------

#[derive(Resource, Default)]
struct PromptBuf(String);

/// mirrors the plugin's status so input handling can gate on it.
#[derive(Resource, Default)]
struct InputGate {
    enabled: bool,
    generating: bool,
}

fn load_config() -> ChatConfig {
    let base = match std::env::var("DRIFT_CONFIG") {
        Ok(path) => ChatConfig::from_path(&path).unwrap_or_else(|err| {
            warn!(target: "drift_demo", "ignoring config {}: {}", path, err);
            ChatConfig::default()
        }),
        Err(_) => ChatConfig::default(),
    };
    let fallback = base.clone();
    base.with_env().unwrap_or_else(|err| {
        warn!(target: "drift_demo", "ignoring environment overrides: {}", err);
        fallback
    })
}

// ---------------------- main ----------------------

fn main() {
    #[cfg(target_arch = "wasm32")]
    console_error_panic_hook::set_once();

    App::new()
        .insert_resource(ClearColor(Color::srgb_u8(10, 10, 14)))
        .insert_resource(load_config())
        .insert_resource(PromptBuf::default())
        .insert_resource(InputGate::default())
        .add_plugins(DefaultPlugins)
        .add_plugins(DriftChatPlugin)
        .add_systems(Startup, setup)
        .add_systems(Update, (handle_text_input, btn_send, btn_stop, refresh_prompt_text))
        // event readers should run after bevy_drift_chat emits events
        .add_systems(
            Update,
            (on_status, on_transcript, on_activity_redraw).after(ChatSet::Drain),
        )
        .run();
}

// ---------------------- setup ui ----------------------

fn button_node(width: f32) -> Node {
    Node {
        width: Val::Px(width),
        height: Val::Px(30.0),
        align_items: AlignItems::Center,
        justify_content: JustifyContent::Center,
        ..default()
    }
}

fn setup(mut commands: Commands) {
    commands.spawn(Camera2d);

    let style_18 = TextFont { font_size: 18.0, ..default() };
    let style_14 = TextFont { font_size: 14.0, ..default() };

    commands
        .spawn((
            Node {
                width: Val::Percent(100.0),
                height: Val::Percent(100.0),
                flex_direction: FlexDirection::Column,
                row_gap: Val::Px(8.0),
                padding: UiRect::all(Val::Px(12.0)),
                ..default()
            },
            BackgroundColor(Color::NONE),
        ))
        .with_children(|p| {
            // --- status light ---
            p.spawn((
                Text::new(ChatState::Idle.label()),
                style_14.clone(),
                TextColor(Color::srgb_u8(0x00, 0xf0, 0xff)),
                StatusText,
            ));

            // --- activity chart ---
            p.spawn((
                Node {
                    width: Val::Percent(100.0),
                    height: Val::Px(90.0),
                    flex_direction: FlexDirection::Row,
                    align_items: AlignItems::FlexEnd,
                    column_gap: Val::Px(1.0),
                    ..default()
                },
                BackgroundColor(rgba(SeriesColors::NORMAL.fill)),
                ChartPanel,
            ))
            .with_children(|chart| {
                for i in 0..WINDOW_LEN {
                    chart.spawn((
                        Node {
                            flex_grow: 1.0,
                            height: Val::Percent(0.0),
                            ..default()
                        },
                        BackgroundColor(Color::srgb_u8(0x00, 0xf0, 0xff)),
                        ChartBar(i),
                    ));
                }
            });

            // --- transcript ---
            p.spawn((
                Node {
                    width: Val::Percent(100.0),
                    flex_grow: 1.0,
                    flex_direction: FlexDirection::Column,
                    row_gap: Val::Px(6.0),
                    padding: UiRect::axes(Val::Px(8.0), Val::Px(12.0)),
                    overflow: Overflow::scroll_y(),
                    ..default()
                },
                BackgroundColor(Color::srgb(0.06, 0.06, 0.08)),
                ScrollPosition::default(),
                TranscriptList,
            ));

            // --- prompt row: > text [send] [stop] ---
            p.spawn((
                Node {
                    width: Val::Percent(100.0),
                    height: Val::Auto,
                    column_gap: Val::Px(8.0),
                    flex_direction: FlexDirection::Row,
                    align_items: AlignItems::Center,
                    ..default()
                },
                BackgroundColor(Color::NONE),
            ))
            .with_children(|row| {
                row.spawn((
                    Node { flex_grow: 1.0, ..default() },
                    Text::new("> "),
                    style_18.clone(),
                    TextColor(Color::WHITE),
                    PromptText,
                ));
                row.spawn((
                    Button,
                    button_node(80.0),
                    BackgroundColor(Color::srgb(0.2, 0.2, 0.25)),
                    BtnSend,
                ))
                .with_children(|b| {
                    b.spawn((Text::new("SEND"), style_14.clone(), TextColor(Color::WHITE)));
                });
                // hidden until a generation starts
                row.spawn((
                    Button,
                    Node { display: Display::None, ..button_node(80.0) },
                    BackgroundColor(Color::srgb(0.35, 0.12, 0.12)),
                    BtnStop,
                ))
                .with_children(|b| {
                    b.spawn((Text::new("STOP"), style_14.clone(), TextColor(Color::WHITE)));
                });
            });
        });
}

// ---------------------- input & buttons ----------------------

fn submit(prompt: &mut PromptBuf, gate: &InputGate, ev_submit: &mut EventWriter<SubmitPrompt>) {
    if !gate.enabled || gate.generating || prompt.0.trim().is_empty() {
        return;
    }
    let msg = std::mem::take(&mut prompt.0);
    info!(target: "drift_demo", "submit -> '{}' (len={})", msg, msg.len());
    ev_submit.write(SubmitPrompt(msg));
}

fn handle_text_input(
    mut ev_kbd: EventReader<KeyboardInput>,
    keys: Res<ButtonInput<KeyCode>>,
    mut prompt: ResMut<PromptBuf>,
    gate: Res<InputGate>,
    mut ev_submit: EventWriter<SubmitPrompt>,
    mut ev_cancel: EventWriter<CancelGeneration>,
) {
    if keys.just_pressed(KeyCode::Escape) && gate.generating {
        ev_cancel.write(CancelGeneration);
    }
    if !gate.enabled {
        // drain so keystrokes typed while disabled don't replay later
        ev_kbd.clear();
        return;
    }

    for ev in ev_kbd.read() {
        if ev.state.is_pressed()
            && let Some(txt) = &ev.text
        {
            let s = txt.replace('\r', "").replace('\n', "");
            prompt.0.push_str(&s);
        }
    }
    if keys.just_pressed(KeyCode::Backspace) {
        prompt.0.pop();
    }
    if keys.just_pressed(KeyCode::Enter) {
        submit(&mut prompt, &gate, &mut ev_submit);
    }
}

fn btn_send(
    mut q: Query<(&Interaction, &mut BackgroundColor), (Changed<Interaction>, With<BtnSend>)>,
    mut prompt: ResMut<PromptBuf>,
    gate: Res<InputGate>,
    mut ev_submit: EventWriter<SubmitPrompt>,
) {
    for (i, mut bg) in &mut q {
        match *i {
            Interaction::Pressed => {
                bg.0 = Color::srgb(0.3, 0.3, 0.35);
                submit(&mut prompt, &gate, &mut ev_submit);
            }
            Interaction::Hovered => bg.0 = Color::srgb(0.25, 0.25, 0.3),
            Interaction::None => bg.0 = Color::srgb(0.2, 0.2, 0.25),
        }
    }
}

fn btn_stop(
    mut q: Query<(&Interaction, &mut BackgroundColor), (Changed<Interaction>, With<BtnStop>)>,
    mut ev_cancel: EventWriter<CancelGeneration>,
) {
    for (i, mut bg) in &mut q {
        match *i {
            Interaction::Pressed => {
                bg.0 = Color::srgb(0.5, 0.15, 0.15);
                info!(target: "drift_demo", "stop clicked");
                ev_cancel.write(CancelGeneration);
            }
            Interaction::Hovered => bg.0 = Color::srgb(0.42, 0.14, 0.14),
            Interaction::None => bg.0 = Color::srgb(0.35, 0.12, 0.12),
        }
    }
}

fn refresh_prompt_text(
    prompt: Res<PromptBuf>,
    gate: Res<InputGate>,
    mut q_prompt: Query<(&mut Text, &mut TextColor), With<PromptText>>,
) {
    if (prompt.is_changed() || gate.is_changed())
        && let Ok((mut t, mut color)) = q_prompt.single_mut()
    {
        let caret = if gate.enabled { " |" } else { "" };
        t.0 = format!("> {}{}", prompt.0, caret);
        color.0 = if gate.enabled { Color::WHITE } else { Color::srgb(0.45, 0.45, 0.5) };
    }
}

// ---------------------- chat events ----------------------

fn on_status(
    mut ev: EventReader<StatusEvt>,
    mut gate: ResMut<InputGate>,
    mut q_status: Query<(&mut Text, &mut TextColor), With<StatusText>>,
    mut q_send: Query<&mut Node, (With<BtnSend>, Without<BtnStop>)>,
    mut q_stop: Query<&mut Node, (With<BtnStop>, Without<BtnSend>)>,
) {
    let Some(StatusEvt { state, input_enabled }) = ev.read().last().copied() else {
        return;
    };
    gate.enabled = input_enabled;
    gate.generating = state == ChatState::Generating;

    if let Ok((mut t, mut color)) = q_status.single_mut() {
        let [r, g, b] = state.color();
        t.0 = state.label().to_string();
        color.0 = Color::srgb_u8(r, g, b);
    }
    // send and stop trade places while generating
    if let Ok(mut node) = q_send.single_mut() {
        node.display = if gate.generating { Display::None } else { Display::Flex };
    }
    if let Ok(mut node) = q_stop.single_mut() {
        node.display = if gate.generating { Display::Flex } else { Display::None };
    }
}

fn role_color(role: Role) -> Color {
    match role {
        Role::User => Color::srgb_u8(0xe0, 0xe0, 0xe0),
        Role::Assistant => Color::srgb_u8(0x00, 0xf0, 0xff),
        Role::System => Color::srgb_u8(0x88, 0x88, 0x88),
    }
}

fn on_transcript(
    mut commands: Commands,
    mut ev: EventReader<TranscriptEvt>,
    mut q_list: Query<(Entity, &mut ScrollPosition), With<TranscriptList>>,
    mut q_lines: Query<(&TranscriptLine, &mut Text)>,
) {
    let Ok((list, mut scroll)) = q_list.single_mut() else {
        return;
    };
    // lines appended this run are not queryable until commands apply
    let mut fresh: Vec<(EntryId, Role, String)> = Vec::new();
    let mut touched = false;
    for evt in ev.read() {
        touched = true;
        match evt {
            TranscriptEvt::Appended { entry, role, text } => fresh.push((*entry, *role, text.clone())),
            TranscriptEvt::Updated { entry, text } => {
                if let Some((_, _, pending)) = fresh.iter_mut().find(|(e, _, _)| e == entry) {
                    pending.clone_from(text);
                    continue;
                }
                for (TranscriptLine(e), mut t) in q_lines.iter_mut() {
                    if e == entry {
                        t.0 = format!("drift: {text}");
                    }
                }
            }
        }
    }
    if !fresh.is_empty() {
        commands.entity(list).with_children(|c| {
            for (entry, role, text) in fresh {
                let prefix = if role == Role::User { "you" } else { "drift" };
                c.spawn((
                    Text::new(format!("{prefix}: {text}")),
                    TextFont { font_size: 16.0, ..default() },
                    TextColor(role_color(role)),
                    TranscriptLine(entry),
                ));
            }
        });
    }
    if touched {
        // auto-scroll; layout clamps the offset to the content height
        scroll.offset_y = f32::MAX;
    }
}

fn rgba([r, g, b, a]: [f32; 4]) -> Color {
    Color::srgba(r, g, b, a)
}

fn on_activity_redraw(
    mut ev: EventReader<ActivityRedrawEvt>,
    mut q_panel: Query<&mut BackgroundColor, (With<ChartPanel>, Without<ChartBar>)>,
    mut q_bars: Query<(&ChartBar, &mut Node, &mut BackgroundColor), Without<ChartPanel>>,
) {
    let Some(ActivityRedrawEvt(frame)) = ev.read().last() else {
        return;
    };
    if let Ok(mut panel) = q_panel.single_mut() {
        panel.0 = rgba(frame.colors.fill);
    }
    let color = rgba(frame.colors.stroke);
    for (ChartBar(i), mut node, mut bg) in q_bars.iter_mut() {
        let v = frame.samples.get(*i).copied().unwrap_or(0.0);
        node.height = Val::Percent(v / bevy_drift_chat::activity::MAX_SAMPLE * 100.0);
        bg.0 = color;
    }
}
