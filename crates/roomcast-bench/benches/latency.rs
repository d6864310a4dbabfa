//! Latency benchmarks for Roomcast.
//!
//! These benchmarks focus on measuring end-to-end latency.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use roomcast_bench::{join_clients, start_instance};
use roomcast_broker::MemoryBroker;
use roomcast_core::InstanceIdentity;
use roomcast_protocol::{codec, Frame, MessageEnvelope};
use std::time::Instant;
use tokio::runtime::Runtime;

/// Benchmark round-trip encode/decode latency.
fn bench_codec_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec_roundtrip");

    let frame = Frame::message_with_ack(1, "lobby", "x".repeat(256));

    group.bench_function("256B", |b| {
        b.iter(|| {
            let encoded = codec::encode(black_box(&frame)).unwrap();
            codec::decode(black_box(&encoded)).unwrap()
        });
    });

    group.finish();
}

/// Benchmark send on one instance until delivery on another.
fn bench_cross_instance(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let mut group = c.benchmark_group("cross_instance");

    let broker = MemoryBroker::new();
    let (one, two) = runtime.block_on(async {
        (
            start_instance(&broker, "1111-1111").await,
            start_instance(&broker, "2222-2222").await,
        )
    });
    let sender = one.connect();
    one.join(sender.id, "lobby").unwrap();
    let mut receivers = join_clients(&two, "lobby", 1);

    group.bench_function("single_receiver", |b| {
        b.iter_custom(|iters| {
            runtime.block_on(async {
                let start = Instant::now();
                for _ in 0..iters {
                    one.send(sender.id, "lobby", "ping").await.unwrap();
                    receivers[0].deliveries.recv().await.unwrap();
                }
                start.elapsed()
            })
        });
    });

    group.finish();
}

/// Benchmark send until delivery on the same instance.
fn bench_local(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let mut group = c.benchmark_group("local");

    let broker = MemoryBroker::new();
    let one = runtime.block_on(start_instance(&broker, "1111-1111"));
    let sender = one.connect();
    one.join(sender.id, "lobby").unwrap();
    let mut receivers = join_clients(&one, "lobby", 10);

    group.bench_function("ten_receivers", |b| {
        b.iter_custom(|iters| {
            runtime.block_on(async {
                let start = Instant::now();
                for _ in 0..iters {
                    one.send(sender.id, "lobby", "ping").await.unwrap();
                    for receiver in &mut receivers {
                        let _ = receiver.deliveries.try_recv();
                    }
                }
                start.elapsed()
            })
        });
    });

    group.finish();
}

/// Benchmark handling of envelopes arriving from the broker.
fn bench_fanout_receive(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let mut group = c.benchmark_group("fanout_receive");

    let broker = MemoryBroker::new();
    let gateway = runtime.block_on(start_instance(&broker, "1111-1111"));
    let mut receivers = join_clients(&gateway, "lobby", 10);

    let remote = MessageEnvelope::new("hello", "lobby", "2222-2222");
    let own = MessageEnvelope::new("hello", "lobby", gateway.identity().as_str());

    group.bench_function("remote_origin", |b| {
        b.iter(|| {
            let outcome = gateway.deliver_fanout(black_box(&remote));
            for receiver in &mut receivers {
                let _ = receiver.deliveries.try_recv();
            }
            outcome
        });
    });

    group.bench_function("self_origin", |b| {
        b.iter(|| gateway.deliver_fanout(black_box(&own)));
    });

    group.bench_function("identity_check", |b| {
        let identity = InstanceIdentity::from_string("1111-1111");
        b.iter(|| identity.is_origin_of(black_box("2222-2222")));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_codec_roundtrip,
    bench_cross_instance,
    bench_local,
    bench_fanout_receive,
);
criterion_main!(benches);
