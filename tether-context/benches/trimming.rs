//! Benchmarks for trimming and pairing on long conversations.

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use tether_context::{trim, validate_pairing};
use tether_types::{Message, ToolCall};

fn long_conversation(turns: usize) -> Vec<Message> {
    let mut messages = vec![Message::system("You are a careful assistant.")];
    for i in 0..turns {
        messages.push(Message::user(format!("question {i}: {}", "detail ".repeat(40))));
        messages.push(Message::assistant_with_calls(
            String::new(),
            vec![ToolCall::function(format!("call_{i}"), "kb_search", r#"{"q":"x"}"#)],
        ));
        messages.push(Message::tool(format!("call_{i}"), "result ".repeat(60)));
        messages.push(Message::assistant(format!("answer {i}: {}", "words ".repeat(50))));
    }
    messages
}

fn bench_trim(c: &mut Criterion) {
    let messages = long_conversation(200);
    c.bench_function("trim_200_turns_to_8k", |b| {
        b.iter(|| trim(black_box(messages.clone()), 8_000))
    });
}

fn bench_pairing(c: &mut Criterion) {
    let messages = long_conversation(200);
    c.bench_function("validate_pairing_200_turns", |b| {
        b.iter(|| validate_pairing(black_box(messages.clone())))
    });
}

fn bench_composed(c: &mut Criterion) {
    let messages = long_conversation(200);
    c.bench_function("trim_then_pair_200_turns", |b| {
        b.iter(|| validate_pairing(trim(black_box(messages.clone()), 8_000)))
    });
}

criterion_group!(benches, bench_trim, bench_pairing, bench_composed);
criterion_main!(benches);
