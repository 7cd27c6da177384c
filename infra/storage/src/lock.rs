//! Advisory locking with bounded exponential backoff.
//!
//! Two providers implement [`AdvisoryLock`]: the native one (`flock` / `LockFileEx` through
//! `fs2`) and a sentinel-file emulation for filesystems that refuse native locks. The provider
//! is picked once per storage root by [`LockProvider::detect`].
//!
//! Locks are advisory: they only exclude participants that take them.

use crate::config::LockStrategy;
use crate::error::{StorageError, StorageErrorExt};
use fs2::FileExt;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

const SENTINEL_SUFFIX: &str = ".lock";
/// `ENOLCK`: the filesystem (often NFS without lockd) has no lock support.
#[cfg(target_os = "linux")]
const ENOLCK: i32 = 37;
pub(crate) const PROBE_FILE: &str = ".regstore.probe";

/// A single, non-blocking lock attempt against an open file.
///
/// A busy lock is reported as an error; the retry policy lives in [`LockManager`].
pub(crate) trait AdvisoryLock {
    async fn try_acquire(&self, path: &Path, file: &std::fs::File) -> io::Result<()>;

    /// Releases the lock and closes `file`.
    async fn release(&self, path: &Path, file: std::fs::File) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct NativeLock;

impl AdvisoryLock for NativeLock {
    async fn try_acquire(&self, _path: &Path, file: &std::fs::File) -> io::Result<()> {
        FileExt::try_lock_exclusive(file)
    }

    async fn release(&self, _path: &Path, file: std::fs::File) -> io::Result<()> {
        FileExt::unlock(&file)
    }
}

/// Emulates exclusivity with a `<path>.lock` sentinel file.
///
/// Best-effort only: the sentinel is created with `create_new`, but a crashed holder leaves a
/// stale sentinel behind, and processes using the native provider ignore sentinels entirely.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SentinelLock;

impl AdvisoryLock for SentinelLock {
    async fn try_acquire(&self, path: &Path, _file: &std::fs::File) -> io::Result<()> {
        let sentinel = sentinel_path(path);
        let created = fs::OpenOptions::new().write(true).create_new(true).open(&sentinel).await;

        let mut marker = match created {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    format!("{} is locked elsewhere", path.display()),
                ));
            },
            Err(err) => return Err(err),
        };

        let stamp = SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_millis());
        if let Err(err) =
            tokio::io::AsyncWriteExt::write_all(&mut marker, stamp.to_string().as_bytes()).await
        {
            drop(marker);
            let _ = fs::remove_file(&sentinel).await;
            return Err(err);
        }
        Ok(())
    }

    async fn release(&self, path: &Path, file: std::fs::File) -> io::Result<()> {
        drop(file);
        match fs::remove_file(sentinel_path(path)).await {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }
}

/// The provider selected for a storage root.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum LockProvider {
    Native,
    Sentinel,
}

impl LockProvider {
    /// Resolves `strategy` to a concrete provider. `Auto` probes native locking once on a
    /// scratch file in `root` and falls back to sentinels if the filesystem rejects it.
    pub(crate) async fn detect(root: &Path, strategy: LockStrategy) -> Self {
        match strategy {
            LockStrategy::Native => Self::Native,
            LockStrategy::Sentinel => Self::Sentinel,
            LockStrategy::Auto => {
                let probe = root.join(PROBE_FILE);
                let outcome = probe_native(&probe).await;
                let _ = fs::remove_file(&probe).await;

                match outcome {
                    Ok(()) => Self::Native,
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => Self::Native,
                    Err(err) if is_unsupported(&err) => {
                        warn!(
                            root = %root.display(),
                            error = %err,
                            "Native file locks unavailable, using best-effort sentinel locks"
                        );
                        Self::Sentinel
                    },
                    Err(err) => {
                        warn!(root = %root.display(), error = %err, "Lock probe failed, assuming native locks");
                        Self::Native
                    },
                }
            },
        }
    }

    pub(crate) const fn strategy(self) -> LockStrategy {
        match self {
            Self::Native => LockStrategy::Native,
            Self::Sentinel => LockStrategy::Sentinel,
        }
    }

    async fn try_acquire(self, path: &Path, file: &std::fs::File) -> io::Result<()> {
        match self {
            Self::Native => NativeLock.try_acquire(path, file).await,
            Self::Sentinel => SentinelLock.try_acquire(path, file).await,
        }
    }

    async fn release(self, path: &Path, file: std::fs::File) -> io::Result<()> {
        match self {
            Self::Native => NativeLock.release(path, file).await,
            Self::Sentinel => SentinelLock.release(path, file).await,
        }
    }
}

async fn probe_native(probe: &Path) -> io::Result<()> {
    let file = fs::OpenOptions::new().create(true).truncate(true).write(true).open(probe).await?;
    let file = file.into_std().await;
    FileExt::try_lock_exclusive(&file)?;
    FileExt::unlock(&file)
}

/// A lock held by someone else, as opposed to a failure of the lock call itself.
fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error().is_some_and(|code| {
            fs2::lock_contended_error().raw_os_error() == Some(code)
        })
}

fn is_unsupported(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::Unsupported {
        return true;
    }
    #[cfg(target_os = "linux")]
    if err.raw_os_error() == Some(ENOLCK) {
        return true;
    }
    false
}

/// Builds the `<path>.lock` sentinel path.
pub(crate) fn sentinel_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map_or_else(OsString::new, OsString::from);
    name.push(SENTINEL_SUFFIX);
    path.with_file_name(name)
}

/// An acquired advisory lock.
///
/// The underlying file stays open and locked until the handle is passed back to
/// `unlock_and_close`. Dropping a handle instead releases a native lock with the descriptor
/// but leaves a sentinel file behind.
#[derive(Debug)]
#[must_use = "A lock handle must be released with `unlock_and_close`"]
pub struct LockHandle {
    path: PathBuf,
    file: Option<std::fs::File>,
    provider: LockProvider,
}

impl LockHandle {
    /// The locked file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The companion sentinel file, when the sentinel provider holds this lock.
    #[must_use]
    pub fn sentinel(&self) -> Option<PathBuf> {
        match self.provider {
            LockProvider::Sentinel => Some(sentinel_path(&self.path)),
            LockProvider::Native => None,
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.file.is_some() {
            warn!(path = %self.path.display(), "Lock handle dropped without unlock_and_close");
        }
    }
}

/// Acquires locks with the configured retry budget.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LockManager {
    provider: LockProvider,
    retries: u32,
    backoff: Duration,
}

impl LockManager {
    pub(crate) const fn new(provider: LockProvider, retries: u32, backoff: Duration) -> Self {
        Self { provider, retries, backoff }
    }

    pub(crate) const fn provider(&self) -> LockProvider {
        self.provider
    }

    /// Locks `path` exclusively and reads its full contents.
    ///
    /// Every attempt reopens the file. A busy lock closes the file and sleeps, starting at the
    /// configured backoff and doubling per retry; the sleep suspends only the calling task.
    /// Only contention is retried: a failure to open the file or of the lock call itself is
    /// returned at once.
    pub(crate) async fn lock_and_read(
        &self,
        path: &Path,
    ) -> Result<(LockHandle, Vec<u8>), StorageError> {
        let mut backoff = self.backoff;
        let mut attempt = 0u32;

        let file = loop {
            attempt += 1;
            let file = fs::File::open(path)
                .await
                .map_err(|err| StorageError::from_io(err, path, "Open for lock failed"))?
                .into_std()
                .await;

            match self.provider.try_acquire(path, &file).await {
                Ok(()) => break file,
                Err(err) if is_contended(&err) && attempt <= self.retries => {
                    debug!(
                        path = %path.display(),
                        attempt,
                        backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "Lock busy, backing off"
                    );
                    drop(file);
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                },
                Err(err) if is_contended(&err) => {
                    drop(file);
                    return Err(StorageError::LockTimeout {
                        attempts: attempt,
                        last_error: err,
                        context: Some(path.display().to_string().into()),
                    });
                },
                Err(err) => {
                    drop(file);
                    return Err(StorageError::Io {
                        source: err,
                        context: Some(format!("Lock attempt failed: {}", path.display()).into()),
                    });
                },
            }
        };

        debug!(path = %path.display(), attempt, "Lock acquired");

        let (file, read) = read_locked(file).await;
        match read {
            Ok(data) => {
                let handle =
                    LockHandle { path: path.to_path_buf(), file: Some(file), provider: self.provider };
                Ok((handle, data))
            },
            Err(err) => {
                if let Err(release_err) = self.provider.release(path, file).await {
                    warn!(path = %path.display(), error = %release_err, "Lock release after failed read failed");
                }
                Err(err)
            },
        }
    }

    /// Releases `handle` and closes its file.
    pub(crate) async fn unlock_and_close(mut handle: LockHandle) -> Result<(), StorageError> {
        let Some(file) = handle.file.take() else {
            return Ok(());
        };

        handle
            .provider
            .release(&handle.path, file)
            .await
            .context(format!("Unlock failed: {}", handle.path.display()))?;

        debug!(path = %handle.path.display(), "Lock released");
        Ok(())
    }
}

/// Reads the whole locked file and hands the descriptor back, whatever the outcome.
async fn read_locked(file: std::fs::File) -> (std::fs::File, Result<Vec<u8>, StorageError>) {
    let mut file = fs::File::from_std(file);

    let result = async {
        let expected = file.metadata().await.context("Locked file stat failed")?.len();
        let mut data = Vec::with_capacity(usize::try_from(expected).unwrap_or_default());
        file.read_to_end(&mut data).await.context("Locked file read failed")?;

        if data.len() as u64 != expected {
            return Err(StorageError::Internal {
                message: format!("expected {expected} bytes, read {}", data.len()).into(),
                context: Some("Locked file changed size while reading".into()),
            });
        }
        Ok(data)
    }
    .await;

    (file.into_std().await, result)
}
