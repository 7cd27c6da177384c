//! Local-disk storage primitives for a package registry.
//!
//! Every file is addressed by a logical name relative to one root directory. On top of that the
//! crate provides exactly three mechanisms:
//!
//! - **Atomic writes**: the payload goes to a sibling temporary file which then replaces the
//!   target, so readers never observe a partial file. Missing parent directories are created.
//! - **Advisory locks**: `lock_and_read` takes an exclusive cross-process lock with bounded
//!   exponential backoff and reads the file; the caller releases it with `unlock_and_close`.
//!   Native `flock`/`LockFileEx` locks are used, with a sentinel-file fallback for filesystems
//!   that refuse them.
//! - **Streaming uploads**: an [`UploadSession`] writes into a hidden temporary file and only
//!   an explicit commit makes it visible under its name; abort discards it.
//!
//! Stale temporary files left by crashed writers are purged when a root is opened.
//!
//! # Examples
//!
//! ```rust
//! use regstore_storage::{Storage, StorageError};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), StorageError> {
//!     # let tmp = tempfile::tempdir().unwrap();
//!     # let root = tmp.path().join("registry");
//!     let storage = Storage::builder().root(&root).lock_retries(2).connect().await?;
//!
//!     let mut upload = storage.write_stream("left-pad/-/left-pad-1.3.0.tgz").await?;
//!     upload.write(b"first chunk,".to_vec()).await?;
//!     upload.write(b" second chunk".to_vec()).await?;
//!     upload.commit().await?;
//!
//!     let tarball = storage.read("left-pad/-/left-pad-1.3.0.tgz").await?;
//!     assert_eq!(tarball, b"first chunk, second chunk");
//!
//!     Ok(())
//! }
//! ```

mod atomic;
mod builder;
mod config;
mod engine;
mod error;
mod lock;
mod maintenance;
mod security;
mod upload;

pub use builder::{NoRoot, StorageBuilder, WithRoot};
pub use config::{LockStrategy, ReplaceStrategy, StorageConfig};
pub use engine::{Storage, StorageInner};
pub use error::{StorageError, StorageErrorExt};
pub use lock::LockHandle;
pub use upload::{UploadSession, UploadState};
