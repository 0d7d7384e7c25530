//! Protocol encoding/decoding benchmarks.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use csmr_protocol::{Codec, Frame, FrameDecoder, FrameFlags, JsonCodec, Message, TargetScope, WireEvent};
use std::sync::Arc;

fn create_publish(payload_size: usize) -> Message {
    Message::Publish {
        inbox_sequence: 12345,
        scope: TargetScope::Subscribers,
        event: WireEvent::new("order.created", "orders-1", 678).with_payload(serde_json::json!({
            "order_id": "o-12345",
            "data": "x".repeat(payload_size),
        })),
    }
}

fn bench_frame_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");

    for size in [100, 1000, 10000] {
        let frame = Frame::new(Bytes::from("x".repeat(size))).with_flags(FrameFlags::new().with_crc());

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, frame| {
            b.iter(|| black_box(frame.encode().unwrap()));
        });
    }

    group.finish();
}

fn bench_frame_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");

    for size in [100, 1000, 10000] {
        let frame = Frame::new(Bytes::from("x".repeat(size))).with_flags(FrameFlags::new().with_crc());
        let encoded = frame.encode().unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, encoded| {
            b.iter(|| {
                let mut buf = encoded.clone();
                black_box(Frame::decode(&mut buf).unwrap())
            });
        });
    }

    group.finish();
}

fn bench_publish_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish_encode");
    let codec = JsonCodec;

    for size in [100, 1000, 10000] {
        let message = create_publish(size);

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), &message, |b, message| {
            b.iter(|| black_box(codec.encode_frame(message, FrameFlags::new().with_crc()).unwrap()));
        });
    }

    group.finish();
}

fn bench_stream_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream_decode");
    let codec: Arc<dyn Codec> = Arc::new(JsonCodec);

    // 100 publishes arriving in one read.
    let mut stream = Vec::new();
    for _ in 0..100 {
        let frame = codec
            .encode_frame(&create_publish(256), FrameFlags::new().with_crc())
            .unwrap();
        stream.extend_from_slice(&frame);
    }

    group.throughput(Throughput::Elements(100));
    group.bench_function("100_publishes", |b| {
        b.iter(|| {
            let mut decoder = FrameDecoder::new(codec.clone());
            decoder.extend(&stream);
            let mut count = 0;
            while let Some(message) = decoder.decode_message().unwrap() {
                black_box(message);
                count += 1;
            }
            assert_eq!(count, 100);
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_frame_encode,
    bench_frame_decode,
    bench_publish_encode,
    bench_stream_decode
);
criterion_main!(benches);
