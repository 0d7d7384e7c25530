//! Checkpoint store benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use csmr_core::{Checkpoint, Context, Status};
use csmr_storage::CheckpointStore;
use tempfile::TempDir;

fn create_checkpoint(instance_id: &str, size: usize, sequence: u64) -> Checkpoint {
    let mut context = Context::default();
    context.insert("data", serde_json::json!("x".repeat(size)));
    context.insert("count", serde_json::json!(sequence));

    let mut watermarks = csmr_core::Watermarks::new();
    for i in 0..8 {
        watermarks.insert(format!("source-{}", i), sequence);
    }
    Checkpoint::new(instance_id, "bench@1:0000", vec!["Running".to_string()], context, Status::Idle)
        .with_delivery(sequence, watermarks, sequence)
}

fn bench_save(c: &mut Criterion) {
    let mut group = c.benchmark_group("checkpoint_save");

    for size in [100, 1000, 10000] {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(dir.path()).unwrap().with_retain(2);
        let mut sequence = 0;

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                sequence += 1;
                black_box(store.save(&create_checkpoint("bench-1", size, sequence)).unwrap())
            });
        });
    }

    group.finish();
}

fn bench_load_latest(c: &mut Criterion) {
    let mut group = c.benchmark_group("checkpoint_load_latest");

    for size in [100, 1000, 10000] {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(dir.path()).unwrap();
        store.save(&create_checkpoint("bench-1", size, 1)).unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &store, |b, store| {
            b.iter(|| black_box(store.load_latest("bench-1").unwrap()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_save, bench_load_latest);
criterion_main!(benches);
