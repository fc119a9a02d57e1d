// benches/benchmarks.rs — Performance benchmarks (criterion)
//
// Hot paths on every chat turn:
//   1. Schema migration on store open
//   2. Key sealing / unsealing
//   3. Cost lookup and title derivation
//   4. Token estimation for streamed replies without vendor usage

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rusqlite::Connection;

use chathub::core::chat::derive_title;
use chathub::core::pricing;
use chathub::core::tokens::{estimate_input, estimate_tokens};
use chathub::provider::{Message, Provider};
use chathub::security::KeyCipher;
use chathub::store::schema::run_migrations;

fn build_history(n: usize) -> Vec<Message> {
    (0..n)
        .map(|i| {
            if i % 2 == 0 {
                Message::user(format!(
                    "Question #{i}: how should I structure error handling across the \
                     storage layer and the request handlers of a small web service?"
                ))
            } else {
                Message::assistant(format!(
                    "Answer #{i}: keep one error enum per crate, convert at the edges, \
                     and log the cause where the status code is decided."
                ))
            }
        })
        .collect()
}

// ─── Benchmark: Startup (schema init) ───────────────────────────────────────

fn bench_startup(c: &mut Criterion) {
    c.bench_function("startup_schema_init", |b| {
        b.iter(|| {
            let conn = Connection::open_in_memory().expect("open in-memory db");
            run_migrations(black_box(&conn)).expect("run migrations");
            conn
        })
    });
}

// ─── Benchmark: Key cipher ──────────────────────────────────────────────────

fn bench_cipher(c: &mut Criterion) {
    let cipher = KeyCipher::from_secret("bench-secret");
    let key = "sk-proj-0123456789abcdefghijklmnopqrstuvwxyzABCDEFGH";
    let sealed = cipher.encrypt(key).expect("encrypt");

    let mut group = c.benchmark_group("cipher");
    group.bench_function("encrypt", |b| {
        b.iter(|| cipher.encrypt(black_box(key)).expect("encrypt"))
    });
    group.bench_function("decrypt", |b| {
        b.iter(|| cipher.decrypt(black_box(&sealed)).expect("decrypt"))
    });
    group.bench_function("derive_key", |b| {
        b.iter(|| KeyCipher::from_secret(black_box("bench-secret")))
    });
    group.finish();
}

// ─── Benchmark: Pricing / titles ────────────────────────────────────────────

fn bench_pricing(c: &mut Criterion) {
    let mut group = c.benchmark_group("pricing");
    group.bench_function("cost_known_model", |b| {
        b.iter(|| pricing::cost(Provider::OpenAI, black_box("gpt-4o-mini"), 1_200, 350))
    });
    group.bench_function("cost_unknown_model", |b| {
        b.iter(|| pricing::cost(Provider::Google, black_box("gemini-ultra-9"), 1_200, 350))
    });
    group.bench_function("catalog", |b| b.iter(pricing::catalog));

    let long = "Explain the difference between ownership and borrowing in Rust with examples ".repeat(4);
    group.bench_function("derive_title", |b| b.iter(|| derive_title(black_box(&long))));
    group.finish();
}

// ─── Benchmark: Token estimation throughput ─────────────────────────────────

fn bench_token_estimation(c: &mut Criterion) {
    let short = "Hello, world!";
    let long = "streamed fragment ".repeat(20_000);
    let history = build_history(100);

    let mut group = c.benchmark_group("token_estimation");
    group.bench_function("short", |b| b.iter(|| estimate_tokens(black_box(short))));
    group.bench_function("long_reply", |b| b.iter(|| estimate_tokens(black_box(&long))));
    group.bench_function("history_100_msgs", |b| {
        b.iter(|| estimate_input(black_box(&history)))
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_startup,
    bench_cipher,
    bench_pricing,
    bench_token_estimation,
);
criterion_main!(benches);
