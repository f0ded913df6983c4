//! Frame codec benchmark suite.
//!
//! Measures the per-message cost of the hot path:
//! - Masked encoding at several payload sizes
//! - Decoding from a receive buffer
//! - Reassembly of a fragmented message
//!
//! Run with: cargo bench --bench frame_codec
//! Results saved to: target/criterion/

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

use automation_bridge::transport::{FrameCodec, MessageAssembler, Opcode};

// ============================================================================
// Benchmark Parameters
// ============================================================================

const PAYLOAD_SIZES: &[usize] = &[16, 125, 4096, 65_536, 1_048_576];

const FRAGMENT_COUNT: usize = 16;

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| b'a' + (i % 26) as u8).collect()
}

// ============================================================================
// Benchmark: Encode
// ============================================================================

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    for &size in PAYLOAD_SIZES {
        let data = payload(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("masked", size), &data, |b, data| {
            b.iter(|| FrameCodec::encode(Opcode::Text, black_box(data), true));
        });
        group.bench_with_input(BenchmarkId::new("unmasked", size), &data, |b, data| {
            b.iter(|| FrameCodec::encode(Opcode::Text, black_box(data), false));
        });
    }

    group.finish();
}

// ============================================================================
// Benchmark: Decode
// ============================================================================

fn bench_decode(c: &mut Criterion) {
    let codec = FrameCodec::default();
    let mut group = c.benchmark_group("decode");

    for &size in PAYLOAD_SIZES {
        let wire = FrameCodec::encode(Opcode::Text, &payload(size), true);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("masked", size), &wire, |b, wire| {
            b.iter(|| {
                let mut buffer = wire.clone();
                codec.decode(black_box(&mut buffer)).unwrap()
            });
        });
    }

    group.finish();
}

// ============================================================================
// Benchmark: Reassembly
// ============================================================================

fn bench_reassembly(c: &mut Criterion) {
    let codec = FrameCodec::default();
    let mut group = c.benchmark_group("reassembly");

    for &size in &PAYLOAD_SIZES[2..] {
        let data = payload(size);
        let chunk = size.div_ceil(FRAGMENT_COUNT);
        let mut wire = Vec::new();
        for (index, part) in data.chunks(chunk).enumerate() {
            let opcode = if index == 0 { Opcode::Text } else { Opcode::Continuation };
            let last = (index + 1) * chunk >= size;
            let mut frame = FrameCodec::encode(opcode, part, true);
            if !last {
                frame[0] &= 0x7F;
            }
            wire.extend_from_slice(&frame);
        }

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("fragments", size), &wire, |b, wire| {
            b.iter(|| {
                let mut buffer = wire.clone();
                let mut assembler = MessageAssembler::default();
                let mut message = None;
                while let Some(frame) = codec.decode(&mut buffer).unwrap() {
                    message = assembler.push(frame).unwrap();
                }
                black_box(message)
            });
        });
    }

    group.finish();
}

// ============================================================================
// Criterion Setup
// ============================================================================

criterion_group!(benches, bench_encode, bench_decode, bench_reassembly);
criterion_main!(benches);
