//! Interpreter benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use csmr_core::{Event, Interpreter, Model};
use serde_json::json;
use std::sync::Arc;

const COUNTER: &str = r#"
name: counter
variables:
  count: { type: int, initial: 0 }
states:
  - { id: init, kind: initial, transitions: [{ target: Running }] }
  - id: Running
    transitions:
      - { event: tick, target: Running, actions: [{ assign: "count := count + $.by" }] }
"#;

/// A parallel state with `regions` regions, each toggling on the same event.
fn parallel_model(regions: usize) -> Model {
    let regions: Vec<_> = (0..regions)
        .map(|i| {
            json!({
                "id": format!("r{}", i),
                "states": [
                    { "id": "init", "kind": "initial", "transitions": [{ "target": "Off" }] },
                    { "id": "Off", "transitions": [{ "event": "flip", "target": "On" }] },
                    { "id": "On", "transitions": [{ "event": "flip", "target": "Off" }] },
                ]
            })
        })
        .collect();
    Model::from_json(&json!({
        "name": "lights",
        "states": [
            { "id": "init", "kind": "initial", "transitions": [{ "target": "Board" }] },
            { "id": "Board", "kind": "parallel", "regions": regions },
        ]
    }))
    .unwrap()
}

fn bench_model_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("model_build");

    group.bench_function("counter_yaml", |b| {
        b.iter(|| black_box(Model::from_yaml(COUNTER).unwrap()));
    });

    group.finish();
}

fn bench_guarded_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("interpreter_step");
    let model = Arc::new(Model::from_yaml(COUNTER).unwrap());
    let mut interp = Interpreter::new(model, "counter-1");
    interp.start().unwrap();
    let event = Event::external("tick").with_payload(json!({ "by": 1 }));

    group.throughput(Throughput::Elements(1));
    group.bench_function("assign", |b| {
        b.iter(|| black_box(interp.process(event.clone()).unwrap()));
    });

    group.finish();
}

fn bench_parallel_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("interpreter_parallel");

    for regions in [2, 8, 32] {
        let mut interp = Interpreter::new(Arc::new(parallel_model(regions)), "lights-1");
        interp.start().unwrap();

        group.throughput(Throughput::Elements(regions as u64));
        group.bench_with_input(BenchmarkId::from_parameter(regions), &regions, |b, _| {
            b.iter(|| black_box(interp.process(Event::external("flip")).unwrap()));
        });
    }

    group.finish();
}

fn bench_checkpoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("interpreter_checkpoint");
    let mut interp = Interpreter::new(Arc::new(parallel_model(16)), "lights-1");
    interp.start().unwrap();
    let checkpoint = interp.checkpoint();

    group.bench_function("take", |b| {
        b.iter(|| black_box(interp.checkpoint()));
    });
    group.bench_function("restore", |b| {
        b.iter(|| {
            let mut fresh = Interpreter::new(interp.model().clone(), "lights-1");
            black_box(fresh.restore(&checkpoint).unwrap())
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_model_build,
    bench_guarded_step,
    bench_parallel_step,
    bench_checkpoint
);
criterion_main!(benches);
