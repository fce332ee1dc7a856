use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use serde_json::json;
use std::hint::black_box;
use tokio::time::Instant;
use uuid::Uuid;

use tandem_collab::awareness::Awareness;
use tandem_collab::broadcast::LocalHub;
use tandem_collab::event::EventMessage;
use tandem_collab::protocol::{Message, SyncMessage};

fn bench_update_encode(c: &mut Criterion) {
    let update = vec![0u8; 64]; // Typical small diff

    c.bench_function("update_encode_64B", |b| {
        b.iter(|| {
            let msg = Message::Sync(SyncMessage::Update(black_box(update.clone())));
            black_box(msg.encode());
        })
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let encoded = Message::Sync(SyncMessage::Update(vec![0u8; 64])).encode();

    c.bench_function("update_decode_64B", |b| {
        b.iter(|| {
            black_box(Message::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_large_step2_decode(c: &mut Criterion) {
    let encoded = Message::Sync(SyncMessage::Step2(vec![7u8; 1024 * 1024])).encode();

    c.bench_function("step2_decode_1MB", |b| {
        b.iter(|| {
            black_box(Message::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_event_decode(c: &mut Criterion) {
    let event = EventMessage::new("evt-1", "comment", "doc-1", 1_700_000_000_000)
        .with_user("ana")
        .with_metadata("thread", ciborium::Value::Text("t-9".into()));
    let bytes = event.encode().unwrap();

    c.bench_function("event_decode", |b| {
        b.iter(|| {
            black_box(EventMessage::decode(black_box(&bytes)).unwrap());
        })
    });
}

fn bench_awareness_apply_100_peers(c: &mut Criterion) {
    let now = Instant::now();
    let mut updates = Vec::new();
    for client in 1..=100u64 {
        let mut peer = Awareness::new(client);
        peer.set_local_state(Some(json!({ "name": format!("peer-{client}"), "cursor": client })), now);
        updates.push(peer.encode_update(&[client]));
    }

    c.bench_function("awareness_apply_100_peers", |b| {
        b.iter_batched(
            || Awareness::new(0),
            |mut awareness| {
                for update in &updates {
                    black_box(awareness.apply_update(update, now).unwrap());
                }
                awareness
            },
            BatchSize::SmallInput,
        )
    });

    c.bench_function("awareness_encode_all_100_peers", |b| {
        let mut full = Awareness::new(0);
        for update in &updates {
            full.apply_update(update, now).unwrap();
        }
        b.iter(|| black_box(full.encode_all()))
    });
}

fn bench_hub_fanout(c: &mut Criterion) {
    let hub = LocalHub::new(1024);
    let group = hub.group("ws://bench/room");
    let mut receivers: Vec<_> = (0..8).map(|_| group.subscribe()).collect();
    let sender = Uuid::new_v4();
    let frame = Message::Sync(SyncMessage::Update(vec![0u8; 64])).encode();

    c.bench_function("hub_publish_8_subscribers", |b| {
        b.iter(|| {
            group.publish(sender, black_box(frame.clone()));
            for rx in receivers.iter_mut() {
                black_box(rx.try_recv().unwrap());
            }
        })
    });
}

criterion_group!(
    benches,
    bench_update_encode,
    bench_update_decode,
    bench_large_step2_decode,
    bench_event_decode,
    bench_awareness_apply_100_peers,
    bench_hub_fanout,
);
criterion_main!(benches);
