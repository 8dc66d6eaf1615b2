use criterion::{criterion_group, criterion_main, Criterion};
use quill_collab::awareness::{AwarenessConfig, AwarenessFields, AwarenessStore, UserInfo};
use quill_collab::broadcast::{BroadcastGroup, Outgoing, PeerInfo};
use quill_collab::presence::{palette_color, PresenceSurface};
use quill_collab::protocol::{AwarenessPayload, SyncMessage};
use quill_core::{CursorPosition, Document};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

fn bench_update_encode(c: &mut Criterion) {
    let mut doc = Document::new(Uuid::new_v4());
    let update = doc.apply_local_insert(0, "fn main() {}").unwrap();
    let bytes = update.encode().unwrap();
    let sender = Uuid::new_v4();

    c.bench_function("sync_update_encode", |b| {
        b.iter(|| {
            let msg = SyncMessage::update(black_box(sender), "src/main.rs", black_box(bytes.clone()));
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let mut doc = Document::new(Uuid::new_v4());
    let update = doc.apply_local_insert(0, "fn main() {}").unwrap();
    let msg = SyncMessage::update(Uuid::new_v4(), "src/main.rs", update.encode().unwrap());
    let encoded = msg.encode().unwrap();

    c.bench_function("sync_update_decode_validate", |b| {
        b.iter(|| {
            let msg = SyncMessage::decode(black_box(&encoded)).unwrap();
            msg.validate("src/main.rs").unwrap();
            black_box(msg.sync_update().unwrap());
        })
    });
}

fn bench_broadcast_100_peers(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_raw_100_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(1024);
                let mut receivers = Vec::new();
                for _ in 0..100 {
                    receivers.push(group.add_peer(PeerInfo::new(None)).await);
                }
                let frame = Arc::new(Outgoing {
                    origin: Uuid::new_v4(),
                    bytes: vec![0u8; 64],
                });
                black_box(group.broadcast_raw(black_box(frame)));
            });
        })
    });
}

fn bench_awareness_merge(c: &mut Criterion) {
    let remote = Uuid::new_v4();

    c.bench_function("awareness_apply_cursor", |b| {
        b.iter_custom(|iters| {
            let mut store = AwarenessStore::new(
                Uuid::new_v4(),
                AwarenessFields::new(UserInfo::new(Uuid::new_v4(), "Local", "#61afef")),
                AwarenessConfig::default(),
            );
            let user = UserInfo::new(Uuid::new_v4(), "Remote", palette_color(remote));

            let start = Instant::now();
            for i in 0..iters {
                let mut fields = AwarenessFields::new(user.clone());
                fields.cursor = Some(CursorPosition::new((i % 80) as u32, 4));
                let payload = AwarenessPayload::State {
                    client_id: remote,
                    timestamp: i,
                    fields,
                };
                store.apply_payload(payload, Instant::now());
            }
            start.elapsed()
        })
    });
}

fn bench_cursor_render_data_1000(c: &mut Criterion) {
    let mut store = AwarenessStore::new(
        Uuid::new_v4(),
        AwarenessFields::new(UserInfo::new(Uuid::new_v4(), "Local", "#61afef")),
        AwarenessConfig::default(),
    );
    let now = Instant::now();
    for i in 0..1000 {
        let id = Uuid::new_v4();
        let mut fields = AwarenessFields::new(UserInfo::new(id, format!("Peer_{i}"), palette_color(id)));
        fields.cursor = Some(CursorPosition::new(i, i % 120));
        store.apply_remote(id, fields, 1, now);
    }

    c.bench_function("cursor_render_data_1000_peers", |b| {
        b.iter(|| black_box(PresenceSurface::cursors(black_box(&store))))
    });
}

criterion_group!(
    benches,
    bench_update_encode,
    bench_update_decode,
    bench_broadcast_100_peers,
    bench_awareness_merge,
    bench_cursor_render_data_1000,
);
criterion_main!(benches);
