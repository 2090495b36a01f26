//! Performance benchmarks for harbor-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use harbor_engine::{MemoryStore, PutRevision, Query, Revision, Storage};
use serde_json::json;

fn put(store: &mut MemoryStore, request: PutRevision) -> Revision {
    store.begin_transaction().unwrap();
    let rev = store.put_revision(request).unwrap();
    store.end_transaction(true).unwrap();
    rev
}

fn populated_store(size: usize) -> MemoryStore {
    let mut store = MemoryStore::new("node1");
    store.begin_transaction().unwrap();
    for i in 0..size {
        store
            .put_revision(PutRevision::new(
                format!("user_{}", i),
                json!({"name": format!("User {}", i), "active": i % 2 == 0}),
                None,
            ))
            .unwrap();
    }
    store.end_transaction(true).unwrap();
    store
}

fn bench_store_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_operations");

    group.bench_function("store_new", |b| b.iter(|| MemoryStore::new(black_box("node1"))));

    group.bench_function("put_create", |b| {
        let mut store = MemoryStore::new("node1");
        let mut id = 0u64;

        b.iter(|| {
            id += 1;
            put(
                &mut store,
                black_box(PutRevision::new(
                    format!("user_{}", id),
                    json!({"name": "Test User"}),
                    None,
                )),
            )
        })
    });

    group.bench_function("put_update_chain", |b| {
        let mut store = MemoryStore::new("node1");
        let mut current = put(&mut store, PutRevision::new("doc", json!({"n": 0}), None));
        let mut n = 0u64;

        b.iter(|| {
            n += 1;
            current = put(
                &mut store,
                PutRevision::new("doc", json!({"n": n}), Some(current.rev_id.clone())),
            );
        })
    });

    group.bench_function("get_document", |b| {
        let store = populated_store(1000);
        b.iter(|| store.get_document(black_box("user_500")))
    });

    group.finish();
}

fn bench_conflicts(c: &mut Criterion) {
    let mut group = c.benchmark_group("conflicts");

    group.bench_function("insert_and_resolve", |b| {
        let mut store = MemoryStore::new("node1");
        let mut id = 0u64;

        b.iter(|| {
            id += 1;
            let doc_id = format!("doc_{}", id);
            let local = put(&mut store, PutRevision::new(doc_id.as_str(), json!({"v": 1}), None));
            let remote = store
                .insert_remote_revision(&doc_id, json!({"v": 2}), false, None)
                .unwrap();
            store.begin_transaction().unwrap();
            store
                .resolve_conflict(&doc_id, &remote.rev_id, &local.rev_id, None)
                .unwrap();
            store.end_transaction(true).unwrap();
        })
    });

    group.finish();
}

fn bench_change_feed(c: &mut Criterion) {
    let mut group = c.benchmark_group("change_feed");

    for size in [100usize, 1000, 5000].iter() {
        group.bench_with_input(BenchmarkId::new("drain", size), size, |b, &size| {
            b.iter(|| {
                let mut store = MemoryStore::new("node1");
                store.set_change_observer(Some(Box::new(|| {})));
                store.begin_transaction().unwrap();
                for i in 0..size {
                    store
                        .put_revision(PutRevision::new(format!("d{}", i), json!({}), None))
                        .unwrap();
                }
                store.end_transaction(true).unwrap();

                let mut total = 0;
                loop {
                    let batch = store.read_changes(black_box(100));
                    if batch.is_empty() {
                        break;
                    }
                    total += batch.len();
                }
                total
            })
        });
    }

    group.finish();
}

fn bench_queries(c: &mut Criterion) {
    let mut group = c.benchmark_group("queries");

    for size in [100usize, 1000].iter() {
        group.bench_with_input(BenchmarkId::new("execute", size), size, |b, &size| {
            let store = populated_store(size);
            let query = Query::where_equals("active", json!(true));
            b.iter(|| store.execute_query(black_box(&query)))
        });

        group.bench_with_input(
            BenchmarkId::new("refresh_unchanged", size),
            size,
            |b, &size| {
                let store = populated_store(size);
                let results = store.execute_query(&Query::all()).unwrap();
                b.iter(|| store.refresh_query(black_box(&results)))
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_store_operations,
    bench_conflicts,
    bench_change_feed,
    bench_queries,
);
criterion_main!(benches);
