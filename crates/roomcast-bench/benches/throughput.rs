//! Throughput benchmarks for Roomcast.
//!
//! These benchmarks measure the raw message throughput of various components.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use roomcast_bench::{drain, join_clients, start_instance};
use roomcast_broker::MemoryBroker;
use roomcast_core::{Delivery, RoomRegistry};
use roomcast_protocol::{codec, Frame};
use std::time::Instant;
use tokio::runtime::Runtime;

fn text(size: usize) -> String {
    "x".repeat(size)
}

/// Benchmark client frame encoding.
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    for size in [64, 1024, 65536] {
        let frame = Frame::delivery("lobby", text(size));
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("binary", size), &frame, |b, frame| {
            b.iter(|| codec::encode(black_box(frame)));
        });
        group.bench_with_input(BenchmarkId::new("text", size), &frame, |b, frame| {
            b.iter(|| codec::encode_text(black_box(frame)));
        });
    }

    group.finish();
}

/// Benchmark client frame decoding.
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");

    for size in [64, 1024, 65536] {
        let frame = Frame::message("lobby", text(size));
        let binary = codec::encode(&frame).unwrap();
        let json = codec::encode_text(&frame).unwrap();

        group.throughput(Throughput::Bytes(binary.len() as u64));
        group.bench_with_input(BenchmarkId::new("binary", size), &binary, |b, data| {
            b.iter(|| codec::decode(black_box(data)));
        });
        group.throughput(Throughput::Bytes(json.len() as u64));
        group.bench_with_input(BenchmarkId::new("text", size), &json, |b, data| {
            b.iter(|| codec::decode_text(black_box(data)));
        });
    }

    group.finish();
}

/// Benchmark registry operations.
fn bench_registry(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry");

    group.bench_function("join_leave", |b| {
        let registry = RoomRegistry::new();
        let (id, _rx) = registry.register();
        let mut i = 0u64;
        b.iter(|| {
            let room = format!("room-{}", i % 64);
            i += 1;
            let _ = registry.join(id, &room);
            let _ = registry.leave(id, &room);
        });
    });

    group.bench_function("is_member", |b| {
        let registry = RoomRegistry::new();
        let (id, _rx) = registry.register();
        registry.join(id, "lobby").unwrap();
        b.iter(|| registry.is_member(black_box(id), black_box("lobby")));
    });

    group.finish();
}

/// Benchmark local fan-out to room members.
fn bench_broadcast(c: &mut Criterion) {
    let mut group = c.benchmark_group("broadcast");

    for size in [10, 100, 1000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let registry = RoomRegistry::new();
            let mut receivers: Vec<_> = (0..size)
                .map(|_| {
                    let (id, rx) = registry.register();
                    registry.join(id, "broadcast").unwrap();
                    rx
                })
                .collect();
            let delivery = Delivery::new("broadcast", "hello");

            b.iter(|| {
                let result = registry.broadcast(black_box(&delivery), None);
                for rx in &mut receivers {
                    let _ = rx.try_recv();
                }
                result
            });
        });
    }

    group.finish();
}

/// Benchmark a full send: local fan-out plus publish to a second instance.
fn bench_gateway_send(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let mut group = c.benchmark_group("gateway_send");

    for size in [1, 100] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let broker = MemoryBroker::new();
            let (one, two) = runtime.block_on(async {
                (
                    start_instance(&broker, "1111-1111").await,
                    start_instance(&broker, "2222-2222").await,
                )
            });
            let sender = one.connect();
            one.join(sender.id, "lobby").unwrap();
            let mut local = join_clients(&one, "lobby", size);
            let mut remote = join_clients(&two, "lobby", size);

            b.iter_custom(|iters| {
                runtime.block_on(async {
                    let start = Instant::now();
                    for _ in 0..iters {
                        let _ = one.send(sender.id, "lobby", "hello").await;
                        // Keep queues from filling and measuring the drop path.
                        drain(&mut local);
                        drain(&mut remote);
                    }
                    start.elapsed()
                })
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_encode,
    bench_decode,
    bench_registry,
    bench_broadcast,
    bench_gateway_send,
);
criterion_main!(benches);
