use regstore_storage::*;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::io::AsyncReadExt;

async fn open(temp: &TempDir) -> Storage {
    Storage::builder().root(temp.path().join("registry")).connect().await.unwrap()
}

#[tokio::test]
async fn test_connect_creates_missing_root() {
    let temp = TempDir::new().unwrap();
    let storage = open(&temp).await;

    assert!(temp.path().join("registry").is_dir());
    assert_eq!(storage.root(), temp.path().join("registry").canonicalize().unwrap());
    assert!(!storage.root().join(".regstore.probe").exists());
}

#[tokio::test]
async fn test_connect_without_create_requires_root() {
    let temp = TempDir::new().unwrap();
    let err =
        Storage::builder().root(temp.path().join("missing")).create(false).connect().await.unwrap_err();

    assert!(matches!(err, StorageError::Io { .. }), "unexpected error: {err:?}");
    assert!(!temp.path().join("missing").exists());
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let temp = TempDir::new().unwrap();
    let err =
        Storage::builder().root(temp.path()).upload_queue_depth(0).connect().await.unwrap_err();

    assert!(matches!(err, StorageError::InvalidState { .. }));
}

#[tokio::test]
async fn test_config_section_applies() {
    let temp = TempDir::new().unwrap();
    let config: StorageConfig =
        serde_json::from_value(json!({ "lock_strategy": "sentinel", "fsync": false })).unwrap();

    let storage = Storage::builder().root(temp.path()).config(config).connect().await.unwrap();

    assert_eq!(storage.lock_strategy(), LockStrategy::Sentinel);
    assert!(!storage.config().fsync);
}

#[tokio::test]
async fn test_path_traversal_blocked() {
    let temp = TempDir::new().unwrap();
    let storage = open(&temp).await;

    for name in ["../etc/passwd", "foo/../../bar", "/etc/passwd"] {
        let err = storage.path_to(name).unwrap_err();
        assert!(matches!(err, StorageError::PathTraversalAttempt { .. }), "{name}: {err:?}");
    }
    assert!(matches!(
        storage.write("../escape.bin", b"x").await,
        Err(StorageError::PathTraversalAttempt { .. })
    ));
    assert!(!temp.path().join("escape.bin").exists());
}

#[tokio::test]
async fn test_path_to_maps_names_under_root() {
    let temp = TempDir::new().unwrap();
    let storage = open(&temp).await;

    let path = storage.path_to("left-pad/package.json").unwrap();
    assert_eq!(path, storage.root().join("left-pad").join("package.json"));
}

#[tokio::test]
async fn test_write_read_roundtrip() {
    let temp = TempDir::new().unwrap();
    let storage = open(&temp).await;

    storage.write("foo/bar.bin", b"hello world").await.unwrap();
    assert!(storage.exists("foo/bar.bin").await.unwrap());
    assert_eq!(storage.read("foo/bar.bin").await.unwrap(), b"hello world");

    let meta = storage.metadata("foo/bar.bin").await.unwrap();
    assert_eq!(meta.len(), 11);
}

#[tokio::test]
async fn test_missing_names_map_to_not_found() {
    let temp = TempDir::new().unwrap();
    let storage = open(&temp).await;

    assert!(!storage.exists("nope.json").await.unwrap());
    assert!(matches!(storage.read("nope.json").await, Err(StorageError::FileNotFound { .. })));
    assert!(matches!(storage.unlink("nope.json").await, Err(StorageError::FileNotFound { .. })));
    assert!(matches!(storage.metadata("nope.json").await, Err(StorageError::FileNotFound { .. })));
    assert!(matches!(storage.read_stream("nope.json").await, Err(StorageError::FileNotFound { .. })));
    assert!(matches!(storage.rmdir("nope").await, Err(StorageError::FileNotFound { .. })));
}

#[tokio::test]
async fn test_json_documents_roundtrip() {
    let temp = TempDir::new().unwrap();
    let storage = open(&temp).await;
    let doc = json!({ "name": "left-pad", "versions": { "1.3.0": { "dist": { "shasum": "abc" } } } });

    storage.create_json("left-pad/package.json", &doc).await.unwrap();
    let read: Value = storage.read_json("left-pad/package.json").await.unwrap();
    assert_eq!(read, doc);

    let raw = String::from_utf8(storage.read("left-pad/package.json").await.unwrap()).unwrap();
    assert!(raw.starts_with("{\n\t\"name\": \"left-pad\""), "unexpected layout: {raw}");

    storage.update_json("left-pad/package.json", &json!({ "name": "left-pad", "versions": {} })).await.unwrap();
    let read: Value = storage.read_json("left-pad/package.json").await.unwrap();
    assert_eq!(read["versions"], json!({}));
}

#[tokio::test]
async fn test_read_json_reports_parse_errors() {
    let temp = TempDir::new().unwrap();
    let storage = open(&temp).await;
    storage.write("broken.json", b"{ \"name\": ").await.unwrap();

    let err = storage.read_json::<Value>("broken.json").await.unwrap_err();
    assert!(matches!(err, StorageError::Json { .. }));
}

#[tokio::test]
async fn test_read_stream_yields_file_content() {
    let temp = TempDir::new().unwrap();
    let storage = open(&temp).await;
    let payload = vec![7u8; 64 * 1024];
    storage.write("pkg/-/pkg-1.0.0.tgz", &payload).await.unwrap();

    let mut reader = storage.read_stream("pkg/-/pkg-1.0.0.tgz").await.unwrap();
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.unwrap();

    assert_eq!(out, payload);
}

#[tokio::test]
async fn test_unlink_and_rmdir() {
    let temp = TempDir::new().unwrap();
    let storage = open(&temp).await;
    storage.write("pkg/package.json", b"{}").await.unwrap();

    let err = storage.rmdir("pkg").await.unwrap_err();
    assert!(matches!(err, StorageError::Io { .. }), "non-empty dir must stay: {err:?}");

    storage.unlink("pkg/package.json").await.unwrap();
    storage.rmdir("pkg").await.unwrap();

    assert!(!storage.exists("pkg").await.unwrap());
}

#[tokio::test]
async fn test_connect_purges_stale_tmp_files() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("registry");
    std::fs::create_dir_all(root.join("pkg")).unwrap();
    std::fs::write(root.join("pkg/package.json"), b"{}").unwrap();
    std::fs::write(root.join("pkg/package.json.tmp0123456789012345"), b"half").unwrap();
    std::fs::write(root.join("pkg/pkg.tgz.tmp-0123456789012345"), b"half").unwrap();

    let storage =
        Storage::builder().root(&root).tmp_max_age_secs(0).connect().await.unwrap();

    assert!(storage.exists("pkg/package.json").await.unwrap());
    assert!(!root.join("pkg/package.json.tmp0123456789012345").exists());
    assert!(!root.join("pkg/pkg.tgz.tmp-0123456789012345").exists());
}

#[tokio::test]
async fn test_purge_can_be_disabled() {
    let temp = TempDir::new().unwrap();
    let stale = temp.path().join("index.json.tmp0123456789012345");
    std::fs::write(&stale, b"half").unwrap();

    let _storage = Storage::builder()
        .root(temp.path())
        .purge_tmp(false)
        .tmp_max_age_secs(0)
        .connect()
        .await
        .unwrap();

    assert!(stale.exists());
}

#[tokio::test]
async fn test_storage_is_shareable_across_tasks() {
    let temp = TempDir::new().unwrap();
    let storage = open(&temp).await;

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let storage = storage.clone();
            tokio::spawn(async move { storage.write(format!("pkg-{i}/package.json"), b"{}").await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    for i in 0..8 {
        assert!(storage.exists(format!("pkg-{i}/package.json")).await.unwrap());
    }
}
