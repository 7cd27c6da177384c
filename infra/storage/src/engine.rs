//! The name-addressed storage handle.
//!
//! [`Storage`] binds a canonical root directory to the three primitives of this crate: atomic
//! writes, advisory locks and streaming uploads. Every operation takes a logical name, resolves
//! it under the root (see [`Storage::path_to`]) and delegates.

use crate::atomic::AtomicWriter;
use crate::builder::StorageBuilder;
use crate::config::{LockStrategy, StorageConfig};
use crate::error::{StorageError, StorageErrorExt};
use crate::lock::{LockHandle, LockManager};
use crate::maintenance;
use crate::security;
use crate::upload::UploadSession;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::ser::PrettyFormatter;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, warn};

/// The internal shared state of a [`Storage`] instance.
#[derive(Debug)]
pub struct StorageInner {
    /// The canonicalized physical path under which every name lives.
    pub(crate) root: PathBuf,
    pub(crate) config: StorageConfig,
    pub(crate) writer: AtomicWriter,
    pub(crate) locks: LockManager,
}

/// A thread-safe handle to one storage root.
///
/// Internally reference-counted; clone it freely across tasks.
///
/// # Example
///
/// ```rust
/// use regstore_storage::{Storage, StorageError};
/// use serde_json::json;
///
/// #[tokio::main]
/// async fn main() -> Result<(), StorageError> {
///     # let tmp = tempfile::tempdir().unwrap();
///     # let root = tmp.path().join("registry");
///     let storage = Storage::builder().root(&root).connect().await?;
///
///     storage.create_json("left-pad/package.json", &json!({ "name": "left-pad" })).await?;
///
///     let (handle, doc) =
///         storage.lock_and_read_json::<serde_json::Value>("left-pad/package.json").await?;
///     let mut doc = doc?;
///     doc["versions"] = json!({});
///     storage.write_json("left-pad/package.json", &doc).await?;
///     storage.unlock_and_close("left-pad/package.json", handle).await?;
///
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Storage {
    pub(crate) inner: Arc<StorageInner>,
}

impl Deref for Storage {
    type Target = StorageInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl Storage {
    #[must_use = "The storage root is not opened until you call .connect()"]
    pub fn builder() -> StorageBuilder {
        StorageBuilder::new()
    }

    /// The canonical root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// The lock provider chosen for this root at connect time, `Native` or `Sentinel`.
    #[must_use]
    pub fn lock_strategy(&self) -> LockStrategy {
        self.inner.locks.provider().strategy()
    }

    /// Resolves a logical name to its absolute path under the root.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::PathTraversalAttempt`] for absolute or empty names and for
    /// names escaping the root through `..` or a symlinked directory.
    pub fn path_to(&self, name: impl AsRef<Path>) -> Result<PathBuf, StorageError> {
        security::resolve_path(&self.root, name)
    }

    /// Reads a whole file.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::FileNotFound`] if the name does not exist.
    pub async fn read(&self, name: impl AsRef<Path>) -> Result<Vec<u8>, StorageError> {
        let path = self.path_to(name)?;
        fs::read(&path).await.map_err(|err| StorageError::from_io(err, &path, "Read failed"))
    }

    /// Reads and parses a JSON document.
    ///
    /// # Errors
    ///
    /// As [`read`](Self::read), plus [`StorageError::Json`] when the content does not parse.
    pub async fn read_json<T: DeserializeOwned>(
        &self,
        name: impl AsRef<Path>,
    ) -> Result<T, StorageError> {
        let name = name.as_ref();
        let data = self.read(name).await?;
        parse_json(name, &data)
    }

    /// Atomically writes `data`, replacing any previous content.
    ///
    /// Missing parent directories are created. Readers see either the old or the new content.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] on disk failures.
    pub async fn write(&self, name: impl AsRef<Path>, data: &[u8]) -> Result<(), StorageError> {
        let path = self.path_to(name)?;
        self.writer.write(&path, data).await
    }

    /// Atomically writes `data` under a name that must not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::AlreadyExists`] without writing if the name is taken.
    pub async fn create(&self, name: impl AsRef<Path>, data: &[u8]) -> Result<(), StorageError> {
        let path = self.path_to(name)?;
        self.writer.create(&path, data).await
    }

    /// Atomically replaces the content of an existing name.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::FileNotFound`] without writing if the name is missing.
    pub async fn update(&self, name: impl AsRef<Path>, data: &[u8]) -> Result<(), StorageError> {
        let path = self.path_to(name)?;
        self.writer.update(&path, data).await
    }

    /// [`write`](Self::write) for a JSON document, pretty-printed with tab indentation.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Json`] if `value` cannot be serialized, otherwise as `write`.
    pub async fn write_json<T: Serialize + ?Sized>(
        &self,
        name: impl AsRef<Path>,
        value: &T,
    ) -> Result<(), StorageError> {
        let data = to_json(value)?;
        self.write(name, &data).await
    }

    /// [`create`](Self::create) for a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Json`] if `value` cannot be serialized, otherwise as `create`.
    pub async fn create_json<T: Serialize + ?Sized>(
        &self,
        name: impl AsRef<Path>,
        value: &T,
    ) -> Result<(), StorageError> {
        let data = to_json(value)?;
        self.create(name, &data).await
    }

    /// [`update`](Self::update) for a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Json`] if `value` cannot be serialized, otherwise as `update`.
    pub async fn update_json<T: Serialize + ?Sized>(
        &self,
        name: impl AsRef<Path>,
        value: &T,
    ) -> Result<(), StorageError> {
        let data = to_json(value)?;
        self.update(name, &data).await
    }

    /// Takes an exclusive advisory lock on `name` and reads its contents.
    ///
    /// Busy locks are retried with exponential backoff. The returned handle must be passed to
    /// [`unlock_and_close`](Self::unlock_and_close) on every exit path.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::LockTimeout`] when the retry budget runs out,
    /// [`StorageError::FileNotFound`] if the name does not exist.
    pub async fn lock_and_read(
        &self,
        name: impl AsRef<Path>,
    ) -> Result<(LockHandle, Vec<u8>), StorageError> {
        let path = self.path_to(name)?;
        self.locks.lock_and_read(&path).await
    }

    /// [`lock_and_read`](Self::lock_and_read) followed by a JSON parse.
    ///
    /// A parse failure does not release the lock: it comes back as the inner result next to
    /// the still-held handle.
    ///
    /// # Errors
    ///
    /// The outer error is the same as for `lock_and_read`; no handle exists in that case.
    pub async fn lock_and_read_json<T: DeserializeOwned>(
        &self,
        name: impl AsRef<Path>,
    ) -> Result<(LockHandle, Result<T, StorageError>), StorageError> {
        let name = name.as_ref();
        let (handle, data) = self.lock_and_read(name).await?;
        Ok((handle, parse_json(name, &data)))
    }

    /// Releases a lock taken by [`lock_and_read`](Self::lock_and_read).
    ///
    /// The handle decides what gets released. A `name` resolving to a different path is
    /// logged and otherwise ignored.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the lock could not be released.
    pub async fn unlock_and_close(
        &self,
        name: impl AsRef<Path>,
        handle: LockHandle,
    ) -> Result<(), StorageError> {
        let name = name.as_ref();
        match self.path_to(name) {
            Ok(path) if path == handle.path() => {},
            Ok(path) => warn!(
                path = %path.display(),
                held = %handle.path().display(),
                "Unlocking a handle under a different name"
            ),
            Err(err) => warn!(
                name = %name.display(),
                held = %handle.path().display(),
                error = %err,
                "Unlocking a handle under an invalid name"
            ),
        }

        LockManager::unlock_and_close(handle).await
    }

    /// Opens a two-phase upload for a name that must not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::AlreadyExists`] if the name is taken; nothing is created then.
    pub async fn write_stream(&self, name: impl AsRef<Path>) -> Result<UploadSession, StorageError> {
        let path = self.path_to(name)?;
        UploadSession::start(path, self.config.upload_queue_depth, self.config.fsync).await
    }

    /// Opens `name` for streaming reads.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::FileNotFound`] if the name does not exist.
    pub async fn read_stream(&self, name: impl AsRef<Path>) -> Result<fs::File, StorageError> {
        let path = self.path_to(name)?;
        fs::File::open(&path).await.map_err(|err| StorageError::from_io(err, &path, "Open failed"))
    }

    /// Deletes a file.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::FileNotFound`] if the name does not exist.
    pub async fn unlink(&self, name: impl AsRef<Path>) -> Result<(), StorageError> {
        let path = self.path_to(name)?;
        fs::remove_file(&path)
            .await
            .map_err(|err| StorageError::from_io(err, &path, "Failed to delete"))?;
        debug!(path = %path.display(), "File deleted");
        Ok(())
    }

    /// Deletes an empty directory.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::FileNotFound`] if it does not exist and [`StorageError::Io`] if it
    /// is not empty.
    pub async fn rmdir(&self, name: impl AsRef<Path>) -> Result<(), StorageError> {
        let path = self.path_to(name)?;
        fs::remove_dir(&path)
            .await
            .map_err(|err| StorageError::from_io(err, &path, "Failed to remove directory"))?;
        debug!(path = %path.display(), "Directory removed");
        Ok(())
    }

    /// Checks whether `name` exists.
    ///
    /// # Errors
    ///
    /// Fails only on invalid names or when existence cannot be determined.
    pub async fn exists(&self, name: impl AsRef<Path>) -> Result<bool, StorageError> {
        let path = self.path_to(name)?;
        fs::try_exists(&path).await.context(format!("Existence check failed: {}", path.display()))
    }

    /// Filesystem metadata of `name`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::FileNotFound`] if the name does not exist.
    pub async fn metadata(
        &self,
        name: impl AsRef<Path>,
    ) -> Result<std::fs::Metadata, StorageError> {
        let path = self.path_to(name)?;
        fs::metadata(&path)
            .await
            .map_err(|err| StorageError::from_io(err, &path, "Failed to get metadata"))
    }

    /// Removes temporary files older than the configured `tmp_max_age`.
    ///
    /// Runs automatically on connect unless `purge_tmp` is disabled.
    pub async fn purge_tmp(&self) {
        maintenance::purge_tmp(&self.root, self.config.tmp_max_age()).await;
    }
}

fn parse_json<T: DeserializeOwned>(name: &Path, data: &[u8]) -> Result<T, StorageError> {
    serde_json::from_slice(data).context(format!("Failed to parse {}", name.display()))
}

/// Pretty-prints `value` with one tab per indentation level.
pub(crate) fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, StorageError> {
    let mut out = Vec::with_capacity(128);
    let mut ser =
        serde_json::Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(b"\t"));
    value.serialize(&mut ser).context("Failed to encode JSON")?;
    Ok(out)
}
