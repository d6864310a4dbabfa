//! End-to-end throughput benchmark for Roomcast.
//!
//! Connects clients split across one or more running servers, joins them
//! all to one room and counts deliveries. With two servers on a shared
//! broker this measures cross-instance fanout.
//!
//! Usage: `e2e_throughput [clients] [ws://host:port/ws ...]`

use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use roomcast_protocol::{codec, Frame};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:3000/ws";
const ROOM: &str = "benchmark";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);
    let mut servers: Vec<String> = args.iter().skip(2).cloned().collect();
    if servers.is_empty() {
        servers.push(DEFAULT_SERVER_URL.to_string());
    }

    println!("Roomcast end-to-end throughput benchmark");
    println!("  Servers: {}", servers.join(", "));
    println!("  Make sure every server is running on the same broker.");
    println!();

    run_room_benchmark(num_clients, servers).await;
}

async fn run_room_benchmark(num_clients: usize, servers: Vec<String>) {
    println!("Room benchmark: {} clients", num_clients);
    println!("  Warmup: {}s, Measurement: {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    let delivered = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let mut handles = Vec::new();

    for client_id in 0..num_clients {
        let url = servers[client_id % servers.len()].clone();
        let delivered = Arc::clone(&delivered);
        let barrier = Arc::clone(&barrier);

        let handle = tokio::spawn(async move {
            if let Err(e) = run_client(client_id, &url, delivered, barrier).await {
                eprintln!("Client {} error: {}", client_id, e);
            }
        });
        handles.push(handle);
    }

    barrier.wait().await;
    println!("All {} clients joined '{}'", num_clients, ROOM);

    println!("Warming up for {}s...", WARMUP_SECS);
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    delivered.store(0, Ordering::SeqCst);
    let start = Instant::now();

    println!("Measuring for {}s...", BENCH_SECS);
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let total = delivered.load(Ordering::SeqCst);
    let per_sec = total as f64 / elapsed.as_secs_f64();

    println!();
    println!("Results");
    println!("  Clients:      {:>10}", num_clients);
    println!("  Duration:     {:>10.2}s", elapsed.as_secs_f64());
    println!("  Deliveries:   {:>10}", total);
    println!("  Throughput:   {:>10.0} deliveries/s", per_sec);
    println!(
        "  Per-Client:   {:>10.0} deliveries/s",
        per_sec / num_clients as f64
    );

    for handle in handles {
        handle.abort();
    }
}

async fn run_client(
    client_id: usize,
    url: &str,
    delivered: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (ws, _) = connect_async(url).await?;
    let (mut sender, mut receiver) = ws.split();

    // `connected` is sent as text before the client picks a format.
    receiver.next().await;

    let join = codec::encode(&Frame::JoinRoom {
        id: Some(client_id as u64),
        room: ROOM.to_string(),
    })?;
    sender.send(Message::Binary(join.to_vec())).await?;

    // Ack
    receiver.next().await;

    barrier.wait().await;

    let message = codec::encode(&Frame::message(ROOM, "x".repeat(64)))?;
    let message = Message::Binary(message.to_vec());

    let recv_task = tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(65536);

        while let Some(result) = receiver.next().await {
            if let Ok(Message::Binary(data)) = result {
                buf.extend_from_slice(&data);
                while let Ok(Some(frame)) = codec::decode_from(&mut buf) {
                    if matches!(frame, Frame::Delivery { .. }) {
                        delivered.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    });

    loop {
        if sender.send(message.clone()).await.is_err() {
            break;
        }
        tokio::task::yield_now().await;
    }

    recv_task.abort();
    Ok(())
}
