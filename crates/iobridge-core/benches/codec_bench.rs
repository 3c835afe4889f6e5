//! Benchmarks for the relay envelope and hashing hot paths
//!
//! Run with: cargo bench -p iobridge-core
//!
//! Every byte the extension moves through a socket crosses the envelope
//! codec twice, and every downloaded piece is hashed once.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use iobridge_core::envelope::{Frame, Message};
use iobridge_core::hashing::HashAlgorithm;

const SIZES: [usize; 3] = [1024, 16 * 1024, 256 * 1024];

// ============================================================================
// Envelope Benchmarks
// ============================================================================

fn bench_encode_tcp_send(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_tcp_send");

    for size in SIZES {
        let message = Message::TcpSend {
            socket_id: 7,
            data: Bytes::from(vec![0xAB; size]),
        };
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &message, |b, message| {
            b.iter(|| black_box(message.encode(42)))
        });
    }

    group.finish();
}

fn bench_decode_tcp_send(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_tcp_send");

    for size in SIZES {
        let wire = Message::TcpSend {
            socket_id: 7,
            data: Bytes::from(vec![0xAB; size]),
        }
        .encode(42);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &wire, |b, wire| {
            b.iter(|| {
                let frame = Frame::decode(wire.clone()).unwrap();
                black_box(Message::decode(&frame).unwrap())
            })
        });
    }

    group.finish();
}

fn bench_udp_recv_round_trip(c: &mut Criterion) {
    let message = Message::UdpRecv {
        socket_id: 3,
        src_port: 6881,
        src_addr: "203.0.113.9".into(),
        data: Bytes::from(vec![0x11; 1400]),
    };

    c.bench_function("udp_recv_round_trip", |b| {
        b.iter(|| {
            let wire = message.encode(0);
            let frame = Frame::decode(wire).unwrap();
            black_box(Message::decode(&frame).unwrap())
        })
    });
}

// ============================================================================
// Hashing Benchmarks
// ============================================================================

fn bench_piece_hash(c: &mut Criterion) {
    let mut group = c.benchmark_group("piece_hash");

    for size in SIZES {
        let data = vec![0x5A; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("sha1", size), &data, |b, data| {
            b.iter(|| black_box(HashAlgorithm::Sha1.digest(data)))
        });
        group.bench_with_input(BenchmarkId::new("sha256", size), &data, |b, data| {
            b.iter(|| black_box(HashAlgorithm::Sha256.digest(data)))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_encode_tcp_send,
    bench_decode_tcp_send,
    bench_udp_recv_round_trip,
    bench_piece_hash,
);

criterion_main!(benches);
