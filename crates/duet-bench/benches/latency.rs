//! Latency benchmarks for Duet.
//!
//! These benchmarks focus on the time from an inbound event to the
//! outbound events it produces.

use criterion::{criterion_group, criterion_main, Criterion};
use duet_core::{ConnectionId, EventGateway, MemoryStore};
use duet_protocol::{ClientEvent, SendMessage, ServerEvent, TypingSignal};
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Runtime;
use tokio::sync::mpsc::UnboundedReceiver;

type Pair = (
    Arc<EventGateway>,
    Vec<ConnectionId>,
    Vec<UnboundedReceiver<ServerEvent>>,
);

/// Two identified connections on a fresh gateway.
fn pair(rt: &Runtime) -> Pair {
    let gateway = Arc::new(EventGateway::new(Arc::new(MemoryStore::new())));
    let mut connections = Vec::new();
    let mut outboxes = Vec::new();
    for user in ["alice", "bob"] {
        let (conn, rx) = gateway.open();
        rt.block_on(gateway.handle(&conn, ClientEvent::UserOnline(user.to_string())));
        connections.push(conn);
        outboxes.push(rx);
    }
    (gateway, connections, outboxes)
}

/// Benchmark send to delivery-ack latency between two online users.
fn bench_send_latency(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("send_latency");

    group.bench_function("online_receiver", |b| {
        b.iter_custom(|iters| {
            let (gateway, connections, mut outboxes) = pair(&rt);
            let event = ClientEvent::SendMessage(SendMessage {
                sender_id: "alice".to_string(),
                receiver_id: "bob".to_string(),
                content: "x".repeat(64),
            });

            let start = Instant::now();
            for _ in 0..iters {
                rt.block_on(gateway.handle(&connections[0], event.clone()));
                while outboxes[1].try_recv().is_ok() {}
                while outboxes[0].try_recv().is_ok() {}
            }
            start.elapsed()
        });
    });

    group.bench_function("offline_receiver", |b| {
        b.iter_custom(|iters| {
            let (gateway, connections, mut outboxes) = pair(&rt);
            let event = ClientEvent::SendMessage(SendMessage {
                sender_id: "alice".to_string(),
                receiver_id: "carol".to_string(),
                content: "x".repeat(64),
            });

            let start = Instant::now();
            for _ in 0..iters {
                rt.block_on(gateway.handle(&connections[0], event.clone()));
                while outboxes[0].try_recv().is_ok() {}
            }
            start.elapsed()
        });
    });

    group.finish();
}

/// Benchmark typing relay latency.
fn bench_typing_latency(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("typing_latency");

    group.bench_function("start_stop", |b| {
        b.iter_custom(|iters| {
            let (gateway, connections, mut outboxes) = pair(&rt);
            let signal = TypingSignal {
                sender_id: "alice".to_string(),
                receiver_id: "bob".to_string(),
            };

            let start = Instant::now();
            for _ in 0..iters {
                let conn = &connections[0];
                rt.block_on(gateway.handle(conn, ClientEvent::TypingStart(signal.clone())));
                rt.block_on(gateway.handle(conn, ClientEvent::TypingStop(signal.clone())));
                while outboxes[1].try_recv().is_ok() {}
            }
            start.elapsed()
        });
    });

    group.finish();
}

criterion_group!(benches, bench_send_latency, bench_typing_latency);
criterion_main!(benches);
