use metastore_query::{
    DocumentStore, Filter, MemoryStore, Paginator, QueryOptions, Record, UpdateExecutor,
};
use serde_json::{json, Value};

fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        _ => panic!("expected object"),
    }
}

fn seeded_store(n: usize) -> MemoryStore {
    MemoryStore::with_records(
        (0..n)
            .map(|i| {
                record(json!({
                    "_id": format!("rec-{:04}", i),
                    "name": format!("asset_{}", i),
                    "location": format!("s3://bucket/asset_{}", i),
                    "session": {"index": i % 7}
                }))
            })
            .collect(),
    )
}

#[tokio::test]
async fn test_pages_concatenate_to_unbounded_query() {
    let store = seeded_store(23);
    let filter = record(json!({"session.index": {"$lt": 5}}));
    let expected = store.query(&filter, &QueryOptions::new()).await.unwrap();

    for batch_size in [1, 2, 4, 16, 17, 100] {
        let pages = Paginator::new(&store, filter.clone(), QueryOptions::new(), batch_size)
            .unwrap()
            .collect_all()
            .await
            .unwrap();
        assert_eq!(pages, expected, "batch size {}", batch_size);
    }
}

#[tokio::test]
async fn test_upsert_is_idempotent() {
    let store = seeded_store(3);
    let executor = UpdateExecutor::new(&store);
    let update = record(json!({"_id": "rec-0001", "name": "renamed", "session.index": 42}));

    executor.upsert_one(&update).await.unwrap();
    let once = store.snapshot().await;
    executor.upsert_one(&update).await.unwrap();
    assert_eq!(store.snapshot().await, once);
}

#[tokio::test]
async fn test_partial_update_preserves_unnamed_fields() {
    let store = MemoryStore::with_records(vec![record(
        json!({"_id": "X", "a": {"b": "old", "c": "keep"}}),
    )]);

    UpdateExecutor::new(&store)
        .upsert_one(&record(json!({"_id": "X", "a.b": "v"})))
        .await
        .unwrap();

    assert_eq!(
        store.snapshot().await,
        vec![record(json!({"_id": "X", "a": {"b": "v", "c": "keep"}}))]
    );
}

#[tokio::test]
async fn test_dry_run_leaves_state_untouched() {
    let store = seeded_store(5);
    let before = store.snapshot().await;
    let executor = UpdateExecutor::new(&store).with_dry_run(true);

    let records = vec![
        record(json!({"_id": "rec-0000", "name": "changed"})),
        record(json!({"_id": "new-record", "name": "new"})),
    ];
    let outcomes = executor.upsert_many(&records).await;

    assert!(outcomes.iter().all(|o| o.is_ok()));
    assert_eq!(store.mutation_count(), 0);
    assert_eq!(store.snapshot().await, before);
}

#[tokio::test]
async fn test_empty_match() {
    let store = seeded_store(5);
    let filter: Filter = record(json!({"name": "does-not-exist"}));
    assert!(store
        .query(&filter, &QueryOptions::new())
        .await
        .unwrap()
        .is_empty());
    assert_eq!(store.count(&filter).await.unwrap(), 0);
    assert!(
        Paginator::new(&store, filter, QueryOptions::new(), 10)
            .unwrap()
            .next_batch()
            .await
            .unwrap()
            .is_none()
    );
}
