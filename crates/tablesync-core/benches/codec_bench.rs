//! Criterion benchmarks for the upstream binary codec.
//!
//! The hot path is `EntryUpdate` (one per remote change); `Snapshot` runs once
//! per reconnect but can carry thousands of records.
//!
//! Run with:
//! ```bash
//! cargo bench --package tablesync-core --bench codec_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tablesync_core::protocol::codec::{decode_message, encode_message};
use tablesync_core::protocol::messages::{EntryRecord, SyncMessage};
use tablesync_core::Value;

// ── Message fixtures ──────────────────────────────────────────────────────────

fn make_double_update() -> SyncMessage {
    SyncMessage::EntryUpdate(EntryRecord {
        key: "/SmartDashboard/Drive/leftSpeed".to_string(),
        value: Value::Double(0.75),
        version: 1234,
    })
}

fn make_string_array_update() -> SyncMessage {
    SyncMessage::EntryUpdate(EntryRecord {
        key: "/SmartDashboard/Auto/options".to_string(),
        value: Value::StringArray((0..16).map(|i| format!("Routine {i}")).collect()),
        version: 7,
    })
}

fn make_snapshot(n: usize) -> SyncMessage {
    SyncMessage::Snapshot(
        (0..n)
            .map(|i| EntryRecord {
                key: format!("/SmartDashboard/key{i}"),
                value: Value::Double(i as f64),
                version: 1,
            })
            .collect(),
    )
}

// ── Benchmark groups ──────────────────────────────────────────────────────────

fn bench_encode(c: &mut Criterion) {
    let messages: &[(&str, SyncMessage)] = &[
        ("Ping", SyncMessage::Ping(42)),
        ("EntryUpdate(double)", make_double_update()),
        ("EntryUpdate(string[16])", make_string_array_update()),
        ("Snapshot(1000)", make_snapshot(1000)),
    ];

    let mut group = c.benchmark_group("encode_message");
    for (name, msg) in messages {
        group.bench_with_input(BenchmarkId::new("msg", name), msg, |b, msg| {
            b.iter(|| {
                encode_message(black_box(msg), black_box(1), black_box(0))
                    .expect("encode must succeed")
            })
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let messages: &[(&str, SyncMessage)] = &[
        ("Ping", SyncMessage::Ping(42)),
        ("EntryUpdate(double)", make_double_update()),
        ("EntryUpdate(string[16])", make_string_array_update()),
        ("Snapshot(1000)", make_snapshot(1000)),
    ];

    let mut group = c.benchmark_group("decode_message");
    for (name, msg) in messages {
        let bytes = encode_message(msg, 1, 0).expect("encode must succeed for benchmark setup");
        group.bench_with_input(BenchmarkId::new("msg", name), &bytes, |b, bytes| {
            b.iter(|| decode_message(black_box(bytes)).expect("decode must succeed"))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
