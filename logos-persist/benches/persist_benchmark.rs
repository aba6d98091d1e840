use criterion::{black_box, criterion_group, criterion_main, Criterion};
use logos_persist::store::StoreManager;
use logos_persist::{crdt, Compactor, StoreConfig, UpdateLog};
use tokio::runtime::Runtime;
use yrs::{Array, Doc, Transact, WriteTxn};

fn doc_with_items(count: u32) -> Doc {
    let doc = Doc::new();
    for i in 0..count {
        let mut txn = doc.transact_mut();
        let items = txn.get_or_insert_array("items");
        items.insert(&mut txn, i, format!("item-{i}"));
    }
    doc
}

fn bench_append(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let manager = StoreManager::new(StoreConfig::for_testing(dir.path().join("db")));
    let handle = rt.block_on(manager.ensure_namespace("bench")).unwrap();
    let log = UpdateLog::new("bench");
    let update = vec![7u8; 128]; // Typical small update

    c.bench_function("log_append_128B", |b| {
        b.iter(|| {
            black_box(log.append(&handle, black_box(&update)).unwrap());
        })
    });
}

fn bench_replay(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let manager = StoreManager::new(StoreConfig::for_testing(dir.path().join("db")));
    let handle = rt.block_on(manager.ensure_namespace("bench")).unwrap();
    let log = UpdateLog::new("bench");
    for i in 0..1_000u32 {
        log.append(&handle, &i.to_le_bytes().repeat(16)).unwrap();
    }

    c.bench_function("log_replay_1k", |b| {
        b.iter(|| {
            black_box(log.replay(&handle, black_box(0)).unwrap());
        })
    });
}

fn bench_compact(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let manager = StoreManager::new(StoreConfig::for_testing(dir.path().join("db")));
    let handle = rt.block_on(manager.ensure_namespace("bench")).unwrap();
    let log = UpdateLog::new("bench");
    let doc = doc_with_items(500);
    let compactor = Compactor::new(500);

    c.bench_function("compact_500_items", |b| {
        b.iter(|| {
            let cursor = log.last_sequence(&handle).unwrap().map_or(0, |s| s + 1);
            black_box(compactor.compact(&log, &handle, &doc, cursor).unwrap());
        })
    });
}

fn bench_encode_full_state(c: &mut Criterion) {
    let doc = doc_with_items(500);

    c.bench_function("encode_full_state_500_items", |b| {
        b.iter(|| {
            black_box(crdt::encode_full_state(black_box(&doc)));
        })
    });
}

criterion_group!(
    benches,
    bench_append,
    bench_replay,
    bench_compact,
    bench_encode_full_state,
);
criterion_main!(benches);
