// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 jobfab contributors

//! Framing and grouped-packet codec benchmarks.
//!
//! Measures the two hot byte paths: length-prefix framing of individual
//! messages and grouped-envelope build/split for batched small messages.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::io::Cursor;

use jobfab::protocol::control::{build_grouped, split_grouped};
use jobfab::transport::FrameCodec;

fn bench_frame_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_roundtrip");
    for size in [64usize, 1024, 65536] {
        let payload = vec![0xA5u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            let mut codec = FrameCodec::new(1 << 24);
            b.iter(|| {
                let frame = FrameCodec::encode(black_box(payload));
                let mut cursor = Cursor::new(frame);
                codec.decode(&mut cursor).unwrap().unwrap()
            });
        });
    }
    group.finish();
}

fn bench_grouped_envelope(c: &mut Criterion) {
    let mut group = c.benchmark_group("grouped_envelope");
    for count in [8usize, 64, 512] {
        let subs: Vec<Vec<u8>> = (0..count).map(|i| vec![(i % 256) as u8; 48]).collect();
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &subs, |b, subs| {
            b.iter(|| {
                let envelope = build_grouped(black_box(subs));
                split_grouped(&envelope).unwrap()
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_frame_roundtrip, bench_grouped_envelope);
criterion_main!(benches);
