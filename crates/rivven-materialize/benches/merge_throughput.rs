/// Materialization Benchmark Suite
///
/// Merge, last-write-wins resolution, decoding and chunked bulk loading.
/// Run with: cargo bench --package rivven-materialize
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rivven_materialize::{
    BulkLoadConfig, BulkLoader, ChangeOp, EntitySchema, EventDecoder, FieldKind, FieldRule,
    FieldValue, Fields, Ingestor, MemoryVersionStore, RawChangeEvent, RecordKey, VersionStore,
    VersionedRecord,
};
use serde_json::json;
use std::sync::Arc;
use tokio::runtime::Runtime;

fn schema() -> EntitySchema {
    EntitySchema::new("titles", "id")
        .field(FieldRule::new("rating", FieldKind::decimal(1)))
        .field(FieldRule::new("genres", FieldKind::text_list(",")))
        .field(FieldRule::new("title", FieldKind::Text))
}

fn version(id: usize, ts: i64) -> VersionedRecord {
    let mut payload = Fields::new();
    payload.insert("rating".into(), FieldValue::Float(ts as f64 / 10.0));
    VersionedRecord {
        key: RecordKey::new("titles", format!("tt{}", id)),
        payload,
        operation: ChangeOp::Update,
        event_ts_ms: ts,
        sequence: ts as u64,
        is_deleted: false,
        ingest_ts_ms: 0,
    }
}

fn raw(i: usize) -> RawChangeEvent {
    RawChangeEvent::snapshot(
        "titles",
        json!({"id": format!("tt{}", i), "rating": "8.5", "genres": "Drama,Crime", "title": "x"}),
        i as i64,
    )
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");

    for keys in [100usize, 10_000].iter() {
        group.throughput(Throughput::Elements(*keys as u64));
        group.bench_with_input(BenchmarkId::from_parameter(keys), keys, |b, &keys| {
            b.iter(|| {
                let store = MemoryVersionStore::new();
                for i in 0..keys {
                    store.merge(version(i, i as i64)).unwrap();
                }
                black_box(store.version_count().unwrap())
            });
        });
    }

    group.finish();
}

fn bench_current_of(c: &mut Criterion) {
    let mut group = c.benchmark_group("current_of");

    for depth in [1usize, 16, 256].iter() {
        let store = MemoryVersionStore::new();
        for ts in 0..*depth {
            store.merge(version(0, ts as i64)).unwrap();
        }
        let key = RecordKey::new("titles", "tt0");

        group.bench_with_input(BenchmarkId::new("versions", depth), depth, |b, _| {
            b.iter(|| black_box(store.current_of(&key).unwrap()));
        });
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let decoder = EventDecoder::new([schema()]);
    let event = raw(42);

    c.bench_function("decode_event", |b| {
        b.iter(|| black_box(decoder.decode(&event).unwrap()));
    });
}

fn bench_bulk_load(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("bulk_load");
    let records: Vec<RawChangeEvent> = (0..10_000).map(raw).collect();
    group.throughput(Throughput::Elements(records.len() as u64));

    for chunk_size in [500usize, 5_000].iter() {
        group.bench_with_input(
            BenchmarkId::new("chunk_size", chunk_size),
            chunk_size,
            |b, &chunk_size| {
                b.to_async(&rt).iter(|| async {
                    let ingestor = Arc::new(Ingestor::new(
                        EventDecoder::new([schema()]),
                        Arc::new(MemoryVersionStore::new()),
                    ));
                    let loader = BulkLoader::new(
                        ingestor,
                        BulkLoadConfig::builder().chunk_size(chunk_size).build(),
                    );
                    black_box(loader.load_bulk("titles", records.clone()).await.unwrap())
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_merge,
    bench_current_of,
    bench_decode,
    bench_bulk_load
);
criterion_main!(benches);
