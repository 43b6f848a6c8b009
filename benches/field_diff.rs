//! Benchmark for the field diff engine
//!
//! Target: a 10K-client export diffs in well under a millisecond

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::{json, Map, Value};
use storage_converge::reconcile::diff::diff;
use storage_converge::reconcile::{field, DesiredState, FieldRule, FieldSpec, Identity, ValueKind};

static RULES: &[FieldSpec] = &[
    field("description", FieldRule::Scalar(ValueKind::Plain)),
    field("clients", FieldRule::Set(ValueKind::Plain)),
    field(
        "root_clients",
        FieldRule::Merge {
            kind: ValueKind::Plain,
            identity: Identity::Whole,
        },
    ),
];

fn clients(count: usize) -> Vec<Value> {
    (0..count)
        .map(|i| Value::from(format!("10.{}.{}.{}", i / 65536, (i / 256) % 256, i % 256)))
        .collect()
}

fn snapshot(count: usize) -> Map<String, Value> {
    let mut current = Map::new();
    current.insert("description".into(), json!("exports"));
    current.insert("clients".into(), Value::Array(clients(count)));
    current.insert("root_clients".into(), Value::Array(clients(count)));
    current
}

fn bench_replace(c: &mut Criterion) {
    let mut group = c.benchmark_group("field_diff");

    for count in [100, 1_000, 10_000] {
        group.throughput(Throughput::Elements(count as u64));
        let current = snapshot(count);

        let mut reversed = clients(count);
        reversed.reverse();
        let mut desired = DesiredState::new();
        desired.insert("clients", Value::Array(reversed));

        group.bench_with_input(BenchmarkId::new("set_unchanged", count), &count, |b, _| {
            b.iter(|| diff(black_box(&current), black_box(&desired), RULES))
        });
    }

    group.finish();
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("field_diff");

    for count in [100, 1_000, 10_000] {
        group.throughput(Throughput::Elements(count as u64));
        let current = snapshot(count);

        let entries: Vec<Value> = (0..50)
            .map(|i| {
                let state = if i % 2 == 0 { "present" } else { "absent" };
                json!({"value": format!("192.168.0.{}", i), "state": state})
            })
            .chain(std::iter::once(json!({"value": "10.0.0.1", "state": "absent"})))
            .collect();
        let mut desired = DesiredState::new();
        desired.insert("root_clients", Value::Array(entries));

        group.bench_with_input(BenchmarkId::new("merge_entries", count), &count, |b, _| {
            b.iter(|| diff(black_box(&current), black_box(&desired), RULES))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_replace, bench_merge);
criterion_main!(benches);
