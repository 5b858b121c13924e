//! LanceDB vector store integration tests (temp directory backed)

mod common;

use common::{record, text_vector, MemoryIndex, TEST_DIM};
use localrag_lib::kb::vectors::{search_many, VectorError, VectorIndex, VectorRecord, VectorStore};
use tempfile::TempDir;

async fn open_store() -> (TempDir, VectorStore) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let store = VectorStore::open(dir.path().join("vectors"), TEST_DIM)
        .await
        .expect("Failed to open store");
    (dir, store)
}

#[tokio::test]
async fn test_collection_lifecycle_is_idempotent() {
    let (_dir, store) = open_store().await;

    assert!(!store.collection_exists("kb1").await.unwrap());
    store.create_collection("kb1").await.unwrap();
    store.create_collection("kb1").await.unwrap();
    assert!(store.collection_exists("kb1").await.unwrap());
    assert_eq!(store.count("kb1").await.unwrap(), 0);

    store.drop_collection("kb1").await.unwrap();
    store.drop_collection("kb1").await.unwrap();
    assert!(!store.collection_exists("kb1").await.unwrap());
}

#[tokio::test]
async fn test_insert_count_and_delete_by_file() {
    let (_dir, store) = open_store().await;
    store.create_collection("kb1").await.unwrap();

    let mut records: Vec<VectorRecord> = (0..4).map(|i| record("f1", i, &format!("alpha {}", i))).collect();
    records.push(record("f2", 0, "beta"));
    store.insert("kb1", &records).await.unwrap();

    assert_eq!(store.count_by_file("kb1", "f1").await.unwrap(), 4);
    assert_eq!(store.count_by_file("kb1", "f2").await.unwrap(), 1);
    assert_eq!(store.count("kb1").await.unwrap(), 5);

    store.delete_by_file("kb1", "f1").await.unwrap();
    assert_eq!(store.count_by_file("kb1", "f1").await.unwrap(), 0);
    assert_eq!(store.count("kb1").await.unwrap(), 1);
}

#[tokio::test]
async fn test_missing_collection_behaviour() {
    let (_dir, store) = open_store().await;

    store.delete_by_file("nope", "f1").await.expect("delete on missing is a no-op");
    assert_eq!(store.count_by_file("nope", "f1").await.unwrap(), 0);

    let err = store
        .insert("nope", &[record("f1", 0, "text")])
        .await
        .expect_err("insert requires the collection");
    assert!(matches!(err, VectorError::CollectionNotFound(_)));

    let err = store
        .search("nope", &text_vector("text", TEST_DIM), 5)
        .await
        .expect_err("search on missing collection");
    assert!(matches!(err, VectorError::CollectionNotFound(_)));
}

#[tokio::test]
async fn test_dimension_mismatch_is_rejected() {
    let (_dir, store) = open_store().await;
    store.create_collection("kb1").await.unwrap();

    let bad = VectorRecord {
        id: "f1_0".into(),
        file_id: "f1".into(),
        content: "short".into(),
        embedding: vec![0.5; TEST_DIM + 1],
    };
    let err = store.insert("kb1", &[bad]).await.expect_err("wrong dimension");
    assert!(matches!(
        err,
        VectorError::DimensionMismatch {
            expected: TEST_DIM,
            actual
        } if actual == TEST_DIM + 1
    ));
}

#[tokio::test]
async fn test_unsafe_file_id_is_rejected_in_filters() {
    let (_dir, store) = open_store().await;
    store.create_collection("kb1").await.unwrap();

    let err = store
        .delete_by_file("kb1", "f1' OR '1'='1")
        .await
        .expect_err("unsafe id");
    assert!(matches!(err, VectorError::InvalidId(_)));
}

#[tokio::test]
async fn test_search_orders_by_cosine_distance() {
    let (_dir, store) = open_store().await;
    store.create_collection("kb1").await.unwrap();
    store
        .insert(
            "kb1",
            &[
                record("f1", 0, "printer driver install"),
                record("f1", 1, "zzzz yyyy"),
                record("f1", 2, "monitor cable"),
            ],
        )
        .await
        .unwrap();

    let hits = store
        .search("kb1", &text_vector("printer driver install", TEST_DIM), 2)
        .await
        .unwrap();

    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].id, "f1_0");
    assert!(hits[0].distance <= hits[1].distance);
    assert!(hits[0].similarity() > 0.99);
    assert!(hits.iter().all(|h| h.collection_id == "kb1"));
}

#[tokio::test]
async fn test_unusual_owner_ids_get_their_own_tables() {
    let (_dir, store) = open_store().await;
    let odd = "notes/with spaces";

    store.create_collection(odd).await.unwrap();
    store.insert(odd, &[record("n1", 0, "hello")]).await.unwrap();

    assert!(store.collection_exists(odd).await.unwrap());
    assert!(!store.collection_exists("notes").await.unwrap());
    assert_eq!(store.count(odd).await.unwrap(), 1);
}

#[tokio::test]
async fn test_search_many_merges_and_survives_failing_collection() {
    let index = MemoryIndex::new();
    index.seed("kb1", vec![record("a", 0, "apple pie"), record("a", 1, "zebra")]);
    index.seed("kb2", vec![record("b", 0, "apple")]);
    index.seed("kb3", vec![record("c", 0, "apple pie")]);
    index.fail_search_in("kb3");

    let query = text_vector("apple pie", TEST_DIM);
    let owners: Vec<String> = ["kb1", "kb2", "kb3", "missing"].iter().map(|s| s.to_string()).collect();
    let hits = search_many(&index, &owners, &query, 2).await;

    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].collection_id, "kb1");
    assert_eq!(hits[0].content, "apple pie");
    assert!(hits[0].distance <= hits[1].distance);
    assert!(hits.iter().all(|h| h.collection_id != "kb3"));
}

#[tokio::test]
async fn test_search_many_over_lancedb_tolerates_missing_collection() {
    let (_dir, store) = open_store().await;
    store.create_collection("kb1").await.unwrap();
    store.insert("kb1", &[record("f1", 0, "vpn reset")]).await.unwrap();

    let owners = vec!["kb1".to_string(), "gone".to_string()];
    let hits = search_many(&store, &owners, &text_vector("vpn reset", TEST_DIM), 5).await;

    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].file_id, "f1");
}
