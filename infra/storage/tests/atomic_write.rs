use proptest::prelude::*;
use regstore_storage::{ReplaceStrategy, Storage, StorageError};
use std::path::Path;
use tempfile::TempDir;

async fn open(root: &Path) -> Storage {
    Storage::builder().root(root).connect().await.unwrap()
}

fn entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_write_creates_missing_directories() {
    let temp = TempDir::new().unwrap();
    let storage = open(temp.path()).await;

    storage.write("a/b/c", b"payload").await.unwrap();

    assert!(temp.path().join("a").is_dir());
    assert!(temp.path().join("a/b").is_dir());
    assert_eq!(std::fs::read(temp.path().join("a/b/c")).unwrap(), b"payload");
}

#[tokio::test]
async fn test_write_leaves_no_tmp_files() {
    let temp = TempDir::new().unwrap();
    let storage = open(temp.path()).await;

    storage.write("pkg/package.json", b"v1").await.unwrap();
    storage.write("pkg/package.json", b"v2").await.unwrap();

    assert_eq!(entries(&temp.path().join("pkg")), vec!["package.json".to_owned()]);
    assert_eq!(storage.read("pkg/package.json").await.unwrap(), b"v2");
}

#[tokio::test]
async fn test_create_refuses_existing_name() {
    let temp = TempDir::new().unwrap();
    let storage = open(temp.path()).await;

    storage.create("index.json", b"original").await.unwrap();
    let err = storage.create("index.json", b"replacement").await.unwrap_err();

    assert!(matches!(err, StorageError::AlreadyExists { .. }), "unexpected error: {err:?}");
    assert_eq!(storage.read("index.json").await.unwrap(), b"original");
}

#[tokio::test]
async fn test_update_refuses_missing_name() {
    let temp = TempDir::new().unwrap();
    let storage = open(temp.path()).await;

    let err = storage.update("pkg/index.json", b"content").await.unwrap_err();

    assert!(matches!(err, StorageError::FileNotFound { .. }), "unexpected error: {err:?}");
    assert!(!temp.path().join("pkg").exists(), "update must not create anything");
}

#[tokio::test]
async fn test_update_replaces_existing_content() {
    let temp = TempDir::new().unwrap();
    let storage = open(temp.path()).await;

    storage.create("index.json", b"v1").await.unwrap();
    storage.update("index.json", b"v2").await.unwrap();

    assert_eq!(storage.read("index.json").await.unwrap(), b"v2");
}

#[tokio::test]
async fn test_overwrite_strategy_writes_in_place() {
    let temp = TempDir::new().unwrap();
    let storage = Storage::builder()
        .root(temp.path())
        .replace_strategy(ReplaceStrategy::Overwrite)
        .connect()
        .await
        .unwrap();

    storage.write("deep/dir/blob.bin", b"first").await.unwrap();
    storage.write("deep/dir/blob.bin", b"second, longer").await.unwrap();
    storage.write("deep/dir/blob.bin", b"third").await.unwrap();

    assert_eq!(storage.read("deep/dir/blob.bin").await.unwrap(), b"third");
    assert_eq!(entries(&temp.path().join("deep/dir")), vec!["blob.bin".to_owned()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_never_expose_partial_content() {
    let temp = TempDir::new().unwrap();
    let storage = open(temp.path()).await;
    let payloads: Vec<Vec<u8>> = (0..16u8).map(|i| vec![i; 32 * 1024]).collect();
    storage.write("shared.bin", &payloads[0]).await.unwrap();

    let writers: Vec<_> = payloads
        .iter()
        .cloned()
        .map(|payload| {
            let storage = storage.clone();
            tokio::spawn(async move { storage.write("shared.bin", &payload).await })
        })
        .collect();

    let reader = {
        let storage = storage.clone();
        let payloads = payloads.clone();
        tokio::spawn(async move {
            for _ in 0..64 {
                let seen = storage.read("shared.bin").await.unwrap();
                assert!(payloads.contains(&seen), "observed a torn write of {} bytes", seen.len());
                tokio::task::yield_now().await;
            }
        })
    };

    for writer in writers {
        writer.await.unwrap().unwrap();
    }
    reader.await.unwrap();

    let last = storage.read("shared.bin").await.unwrap();
    assert!(payloads.contains(&last));
    assert_eq!(entries(temp.path()), vec!["shared.bin".to_owned()]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn written_bytes_read_back_unchanged(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let temp = TempDir::new().unwrap();

        let read = rt.block_on(async {
            let storage = Storage::builder().root(temp.path()).fsync(false).connect().await.unwrap();
            storage.write("blob.bin", &data).await.unwrap();
            storage.read("blob.bin").await.unwrap()
        });

        prop_assert_eq!(read, data);
    }
}
