use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use arbor_core::{Authorization, Event, Path, Persistence};
use arbor_sync::{
    Database, Distributor, EngineConfig, JournalRecord, ListenerKind, Outbound, Snapshot,
};
use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::json;
use std::hint::black_box;
use uuid::Uuid;

fn populated(users: usize) -> Persistence {
    let mut persistence = Persistence::default();
    for i in 0..users {
        let event = Event::set(
            format!("/users/{i}"),
            json!({"name": format!("user{i}"), "age": i % 90, "tags": {"a": true}}),
        );
        persistence.apply(&event, i as u64).unwrap();
    }
    persistence
}

fn bench_journal_record(c: &mut Criterion) {
    let event = Event::set("/users/42", json!({"name": "Ann", "age": 30, "city": "Oslo"}));

    c.bench_function("journal_record_encode", |b| {
        b.iter(|| {
            let record = JournalRecord::for_event(black_box(42), black_box(&event)).unwrap();
            black_box(record.encode().unwrap());
        })
    });

    let encoded = JournalRecord::for_event(42, &event).unwrap().encode().unwrap();
    c.bench_function("journal_record_decode", |b| {
        b.iter(|| {
            let record = JournalRecord::decode(black_box(&encoded)).unwrap();
            black_box(record.event().unwrap());
        })
    });
}

fn bench_snapshot_encode(c: &mut Criterion) {
    let persistence = populated(1_000);
    let snapshot = Snapshot::new(1_000, persistence.root().clone());

    c.bench_function("snapshot_encode_1k_users", |b| {
        b.iter(|| black_box(snapshot.encode().unwrap()))
    });
}

fn bench_distribute_fanout(c: &mut Criterion) {
    let mut persistence = populated(100);
    let authorization = Arc::new(Authorization::allow_all());
    let dropped = Arc::new(AtomicU64::new(0));
    let users = Path::parse("/users/42").unwrap();

    let mut connections: Vec<_> = (0..100)
        .map(|_| {
            let (outbound, rx) = Outbound::channel(1024, dropped.clone());
            let mut d = Distributor::new(Uuid::new_v4(), "", authorization.clone(), outbound);
            d.attach_listener(&persistence, users.clone(), ListenerKind::Value);
            (d, rx)
        })
        .collect();
    let mut seq = 1_000u64;

    c.bench_function("distribute_value_100_connections", |b| {
        b.iter(|| {
            seq += 1;
            let event = Event::set("/users/42/age", json!(seq % 90));
            let log = persistence.apply(&event, seq).unwrap();
            for (d, rx) in connections.iter_mut() {
                d.distribute(persistence.root(), &event, &log);
                while let Some(msg) = rx.try_recv() {
                    black_box(msg);
                }
            }
        })
    });
}

fn bench_engine_write(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let config = EngineConfig {
        sync_writes: false,
        ..EngineConfig::for_testing()
    };
    let db = runtime.block_on(Database::open(config)).unwrap();
    let conn = runtime.block_on(db.connect()).unwrap();
    let mut i = 0u64;

    c.bench_function("engine_set_and_apply", |b| {
        b.iter(|| {
            i += 1;
            runtime.block_on(async {
                let seq = conn.set("/bench/value", i as i64, None).await.unwrap();
                db.wait_applied(seq).await.unwrap();
            })
        })
    });

    runtime.block_on(async {
        conn.close().await.unwrap();
        db.shutdown().await.unwrap();
    });
}

criterion_group!(
    benches,
    bench_journal_record,
    bench_snapshot_encode,
    bench_distribute_fanout,
    bench_engine_write,
);
criterion_main!(benches);
