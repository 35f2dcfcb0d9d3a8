use criterion::{criterion_group, criterion_main, Criterion};
use mosaic_sync::protocol::{compress_snapshot, decompress_snapshot, ClientMessage, ServerMessage};
use mosaic_sync::storage::{PixelStore, RocksStore, StoreConfig};
use mosaic_sync::{
    Cell, ClientIdentity, Color, Command, CooldownTracker, EventBus, GridConfig, GridDimensions,
    GridStore, Mutation, MutationEvent, Role, SyncEngine, WriteRequest,
};
use std::hint::black_box;
use std::time::{Duration, Instant};
use uuid::Uuid;

fn bypassing_engine(width: u32, height: u32) -> (SyncEngine, ClientIdentity) {
    let engine = SyncEngine::new(GridConfig::new(width, height, Duration::from_secs(10)));
    let admin = ClientIdentity::new(Uuid::new_v4(), Role::Admin);
    engine
        .submit(WriteRequest::new(admin, Command::SetBypass { enabled: true }))
        .unwrap();
    (engine, admin)
}

fn bench_grid_put(c: &mut Criterion) {
    let grid = GridStore::new(GridDimensions::new(256, 256));
    let mut i = 0u32;

    c.bench_function("grid_put_256x256", |b| {
        b.iter(|| {
            i = i.wrapping_add(7919);
            black_box(grid.put(i % 256, (i / 256) % 256, Color::BLACK).unwrap());
        })
    });
}

fn bench_grid_snapshot(c: &mut Criterion) {
    let grid = GridStore::new(GridDimensions::new(256, 256));
    for y in 0..256 {
        for x in (0..256).step_by(2) {
            grid.put(x, y, Color::WHITE).unwrap();
        }
    }

    c.bench_function("grid_snapshot_32k_cells", |b| {
        b.iter(|| black_box(grid.snapshot()))
    });
}

fn bench_cooldown_admit(c: &mut Criterion) {
    let tracker = CooldownTracker::new(Duration::from_secs(10));
    let clients: Vec<Uuid> = (0..1000).map(|_| Uuid::new_v4()).collect();
    let now = Instant::now();
    let mut i = 0usize;

    c.bench_function("cooldown_try_admit_1000_clients", |b| {
        b.iter(|| {
            i = (i + 1) % clients.len();
            black_box(tracker.try_admit(black_box(clients[i]), now));
        })
    });
}

fn bench_bus_publish_100_observers(c: &mut Criterion) {
    let bus = EventBus::new(1 << 20);
    let _subscriptions: Vec<_> = (0..100).map(|_| bus.subscribe(Uuid::new_v4())).collect();
    let cell = Cell::new(1, 1, Color::BLACK);
    let mut sequence = 0u64;

    c.bench_function("bus_publish_100_observers", |b| {
        b.iter(|| {
            sequence += 1;
            black_box(bus.publish(MutationEvent::new(sequence, Mutation::Update(cell))));
        })
    });
}

fn bench_engine_submit(c: &mut Criterion) {
    let (engine, admin) = bypassing_engine(128, 128);
    let mut i = 0u32;

    c.bench_function("engine_submit_paint", |b| {
        b.iter(|| {
            i = i.wrapping_add(1);
            let request = WriteRequest::paint(admin, i % 128, (i / 128) % 128, Color::from_u32(i));
            black_box(engine.submit(request).unwrap());
        })
    });
}

fn bench_engine_join(c: &mut Criterion) {
    let (engine, admin) = bypassing_engine(128, 128);
    for i in 0..4096u32 {
        engine
            .submit(WriteRequest::paint(admin, i % 128, i / 128, Color::BLACK))
            .unwrap();
    }
    let observer = Uuid::new_v4();

    c.bench_function("engine_join_4k_cells", |b| {
        b.iter(|| black_box(engine.join(observer)))
    });
}

fn bench_message_encode(c: &mut Criterion) {
    let msg = ClientMessage::Paint {
        x: 12,
        y: 34,
        color: Color::rgb(0, 255, 0),
    };

    c.bench_function("client_paint_encode", |b| {
        b.iter(|| black_box(black_box(&msg).encode().unwrap()))
    });
}

fn bench_event_decode(c: &mut Criterion) {
    let msg = ServerMessage::Event(MutationEvent::new(
        42,
        Mutation::Insert(Cell::new(3, 4, Color::WHITE)),
    ));
    let encoded = msg.encode().unwrap();

    c.bench_function("server_event_decode", |b| {
        b.iter(|| black_box(ServerMessage::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_snapshot_compression(c: &mut Criterion) {
    let (engine, admin) = bypassing_engine(64, 64);
    for i in 0..2048u32 {
        engine
            .submit(WriteRequest::paint(admin, i % 64, i / 64, Color::from_u32(i % 20)))
            .unwrap();
    }
    let snapshot = engine.snapshot();
    let compressed = compress_snapshot(&snapshot).unwrap();

    c.bench_function("snapshot_compress_2k_cells", |b| {
        b.iter(|| black_box(compress_snapshot(black_box(&snapshot)).unwrap()))
    });
    c.bench_function("snapshot_decompress_2k_cells", |b| {
        b.iter(|| black_box(decompress_snapshot(black_box(&compressed)).unwrap()))
    });
}

fn bench_rocks_persist(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("mosaic_bench_persist_{}", Uuid::new_v4()));
    let store = RocksStore::open(StoreConfig::for_testing(&dir), GridDimensions::new(256, 256)).unwrap();
    let mut i = 0u32;

    c.bench_function("rocks_persist_cell", |b| {
        b.iter(|| {
            i = i.wrapping_add(1);
            let cell = Cell::new(i % 256, (i / 256) % 256, Color::BLACK);
            store.persist(black_box(&cell)).unwrap();
        })
    });

    drop(store);
    let _ = std::fs::remove_dir_all(&dir);
}

criterion_group!(
    benches,
    bench_grid_put,
    bench_grid_snapshot,
    bench_cooldown_admit,
    bench_bus_publish_100_observers,
    bench_engine_submit,
    bench_engine_join,
    bench_message_encode,
    bench_event_decode,
    bench_snapshot_compression,
    bench_rocks_persist,
);
criterion_main!(benches);
