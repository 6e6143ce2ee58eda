//! Framing benchmarks
//!
//! Measures length-prefix encoding and frame reading for different payload
//! sizes, without any socket involved.

use std::io::Cursor;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use peerlink::protocol::framing::{encode_frame, write_frame, FrameReader, ReadOutcome};

const SIZES: [(usize, &str); 4] = [(16, "16B"), (1024, "1KB"), (64 * 1024, "64KB"), (1024 * 1024, "1MB")];

fn bench_encode_by_size(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");

    for (size, label) in SIZES {
        let payload = vec![0x5Au8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(label), &payload, |b, payload| {
            b.iter(|| black_box(encode_frame(payload).unwrap()))
        });
    }

    group.finish();
}

fn bench_read_by_size(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_read");

    for (size, label) in SIZES {
        let wire = encode_frame(&vec![0x5Au8; size]).unwrap();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(label), &wire, |b, wire| {
            b.iter(|| {
                let mut reader = FrameReader::new(Cursor::new(wire.as_ref()));
                match reader.read_frame() {
                    ReadOutcome::Frame(payload) => black_box(payload),
                    other => panic!("unexpected outcome: {:?}", other),
                }
            })
        });
    }

    group.finish();
}

fn bench_stream_of_small_frames(c: &mut Criterion) {
    let mut wire = Vec::new();
    for i in 0..1000u32 {
        write_frame(&mut wire, &i.to_be_bytes()).unwrap();
    }

    c.bench_function("frame_read_1000_small", |b| {
        b.iter(|| {
            let mut reader = FrameReader::new(Cursor::new(wire.as_slice()));
            let mut count = 0;
            while let ReadOutcome::Frame(payload) = reader.read_frame() {
                count += payload.len();
            }
            black_box(count)
        })
    });
}

criterion_group!(
    benches,
    bench_encode_by_size,
    bench_read_by_size,
    bench_stream_of_small_frames
);
criterion_main!(benches);
