use assert_matches::assert_matches;
use bytes::Bytes;
use pretty_assertions::assert_eq;

use crate::object_store::{
    InMemoryObjectStore,
    LocalObjectStore,
    ObjectStore,
    ObjectStoreError,
};

#[tokio::test]
async fn in_memory_round_trip_and_sorted_listing() {
    let store = InMemoryObjectStore::new();
    store.put_object("raw/b.jsonl", Bytes::from_static(b"b")).await.unwrap();
    store.put_object("raw/a.jsonl", Bytes::from_static(b"a")).await.unwrap();
    store.put_object("unified/c.parquet", Bytes::from_static(b"c")).await.unwrap();

    assert_eq!(store.get_object("raw/a.jsonl").await.unwrap(), Some(Bytes::from_static(b"a")));
    assert_eq!(store.get_object("raw/missing").await.unwrap(), None);
    assert_eq!(store.list_objects("raw/").await.unwrap(), vec!["raw/a.jsonl", "raw/b.jsonl"]);
}

#[tokio::test]
async fn in_memory_copy_then_delete() {
    let store = InMemoryObjectStore::new();
    store.put_object("tmp/x", Bytes::from_static(b"x")).await.unwrap();
    store.copy_object("tmp/x", "final/x").await.unwrap();
    store.delete_object("tmp/x").await.unwrap();

    assert_eq!(store.get_object("final/x").await.unwrap(), Some(Bytes::from_static(b"x")));
    assert_eq!(store.get_object("tmp/x").await.unwrap(), None);
}

#[tokio::test]
async fn in_memory_copy_of_missing_source_fails() {
    let store = InMemoryObjectStore::new();
    let result = store.copy_object("missing", "anywhere").await;
    assert_matches!(result, Err(ObjectStoreError::NotFound(key)) if key == "missing");
}

#[tokio::test]
async fn local_store_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalObjectStore::new(dir.path());

    store.put_object("nested/prefix/object.json", Bytes::from_static(b"{}")).await.unwrap();
    assert_eq!(
        store.get_object("nested/prefix/object.json").await.unwrap(),
        Some(Bytes::from_static(b"{}"))
    );
    assert_eq!(store.get_object("nested/other").await.unwrap(), None);
    assert_eq!(
        store.list_objects("nested/").await.unwrap(),
        vec!["nested/prefix/object.json"]
    );
}

#[tokio::test]
async fn local_store_put_leaves_no_temp_file_behind() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalObjectStore::new(dir.path());

    store.put_object("a/checkpoint.json", Bytes::from_static(b"1")).await.unwrap();
    store.put_object("a/checkpoint.json", Bytes::from_static(b"2")).await.unwrap();

    assert_eq!(store.list_objects("a/").await.unwrap(), vec!["a/checkpoint.json"]);
    assert_eq!(
        store.get_object("a/checkpoint.json").await.unwrap(),
        Some(Bytes::from_static(b"2"))
    );
}

#[tokio::test]
async fn local_store_delete_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalObjectStore::new(dir.path());
    store.put_object("k", Bytes::from_static(b"v")).await.unwrap();
    store.delete_object("k").await.unwrap();
    store.delete_object("k").await.unwrap();
    assert_eq!(store.get_object("k").await.unwrap(), None);
}
