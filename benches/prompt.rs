use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;

use bevy_drift_chat::{ActivityWindow, ConversationHistory, PromptBuilder, Turn, activity_sample};

fn bench_prompt_build(c: &mut Criterion) {
    let mut history = ConversationHistory::new();
    for i in 0..64 {
        history.append(Turn::user(format!("question {i}: how does the ring buffer evict samples?")));
        history.append(Turn::assistant(format!("answer {i}: the oldest sample is dropped first.")));
    }
    let builder = PromptBuilder::default();

    c.bench_function("prompt_build_recent_3", |b| {
        b.iter(|| builder.build(history.recent(black_box(3)), black_box("and what about alerts?")))
    });
}

fn bench_activity_push(c: &mut Criterion) {
    c.bench_function("activity_push_and_redraw", |b| {
        let mut window = ActivityWindow::new();
        let mut step = 0usize;
        b.iter(|| {
            step += 1;
            window.push(activity_sample(step, black_box(" token")));
            black_box(window.take_redraw());
        })
    });
}

criterion_group!(benches, bench_prompt_build, bench_activity_push);
criterion_main!(benches);
