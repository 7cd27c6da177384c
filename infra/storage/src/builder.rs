use crate::atomic::AtomicWriter;
use crate::config::{LockStrategy, ReplaceStrategy, StorageConfig};
use crate::engine::{Storage, StorageInner};
use crate::error::{StorageError, StorageErrorExt};
use crate::lock::{LockManager, LockProvider};
use private::Sealed;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Default)]
pub struct NoRoot;
#[derive(Debug)]
pub struct WithRoot(PathBuf);

mod private {
    pub(super) trait Sealed {}
}
impl Sealed for NoRoot {}
impl Sealed for WithRoot {}

#[allow(private_bounds)]
#[derive(Debug, Default)]
pub struct StorageBuilder<S: Sealed = NoRoot> {
    state: S,
    config: StorageConfig,
}

#[allow(private_bounds)]
impl<S: Sealed> StorageBuilder<S> {
    /// Replaces every knob at once, e.g. with a section of the host's config file.
    #[must_use = "Sets the full storage configuration"]
    pub fn config(mut self, config: StorageConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use = "Sets whether the storage root should be created if it does not exist"]
    pub const fn create(mut self, enable: bool) -> Self {
        self.config.create = enable;
        self
    }

    #[must_use = "Sets whether written files are synced to disk"]
    pub const fn fsync(mut self, enable: bool) -> Self {
        self.config.fsync = enable;
        self
    }

    #[must_use = "Sets how many times a busy lock is retried"]
    pub const fn lock_retries(mut self, retries: u32) -> Self {
        self.config.lock_retries = retries;
        self
    }

    #[must_use = "Sets the initial lock backoff in milliseconds"]
    pub const fn lock_backoff_ms(mut self, millis: u64) -> Self {
        self.config.lock_backoff_ms = millis;
        self
    }

    #[must_use = "Sets the advisory lock provider"]
    pub const fn lock_strategy(mut self, strategy: LockStrategy) -> Self {
        self.config.lock_strategy = strategy;
        self
    }

    #[must_use = "Sets how temporary files replace their target"]
    pub const fn replace_strategy(mut self, strategy: ReplaceStrategy) -> Self {
        self.config.replace_strategy = strategy;
        self
    }

    #[must_use = "Sets the upload chunk queue depth"]
    pub const fn upload_queue_depth(mut self, depth: usize) -> Self {
        self.config.upload_queue_depth = depth;
        self
    }

    #[must_use = "Sets whether stale temporary files are purged on connect"]
    pub const fn purge_tmp(mut self, enable: bool) -> Self {
        self.config.purge_tmp = enable;
        self
    }

    #[must_use = "Sets the age after which a temporary file counts as stale"]
    pub const fn tmp_max_age_secs(mut self, secs: u64) -> Self {
        self.config.tmp_max_age_secs = secs;
        self
    }

    fn transition<N: Sealed>(self, state: N) -> StorageBuilder<N> {
        StorageBuilder { state, config: self.config }
    }
}

impl StorageBuilder<NoRoot> {
    #[must_use = "Creates a new storage builder with default configuration"]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use = "Sets the root directory of the storage"]
    pub fn root(self, path: impl Into<PathBuf>) -> StorageBuilder<WithRoot> {
        self.transition(WithRoot(path.into()))
    }
}

impl StorageBuilder<WithRoot> {
    /// Opens the storage root.
    ///
    /// Boot sequence:
    /// 1. Validates the configuration.
    /// 2. Creates the root when it is missing and `create(true)` was set (the default).
    /// 3. Canonicalizes the root so name resolution can detect symlink escapes.
    /// 4. Picks the lock provider, probing native locks once for `LockStrategy::Auto`.
    /// 5. Purges stale temporary files unless disabled. This step never fails.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidState`] for an invalid configuration and
    /// [`StorageError::Io`] when the root cannot be created or resolved, including a missing
    /// root with `create(false)`.
    pub async fn connect(self) -> Result<Storage, StorageError> {
        let Self { state: WithRoot(root), config } = self;
        config.validate()?;

        if config.create {
            let exists = fs::try_exists(&root)
                .await
                .context(format!("Failed to inspect storage root: {}", root.display()))?;
            if !exists {
                fs::create_dir_all(&root)
                    .await
                    .context(format!("Failed to bootstrap storage root: {}", root.display()))?;
                warn!(path = %root.display(), "Created new storage root directory");
            }
        }

        let canonical = fs::canonicalize(&root)
            .await
            .context(format!("Failed to resolve storage root: {}", root.display()))?;

        let provider = LockProvider::detect(&canonical, config.lock_strategy).await;
        info!(
            path = %canonical.display(),
            lock = ?provider.strategy(),
            replace = ?config.replace_strategy.resolve(),
            "Storage root ready"
        );

        let storage = Storage {
            inner: Arc::new(StorageInner {
                writer: AtomicWriter::new(config.replace_strategy, config.fsync),
                locks: LockManager::new(provider, config.lock_retries, config.lock_backoff()),
                root: canonical,
                config,
            }),
        };

        if storage.config.purge_tmp {
            storage.purge_tmp().await;
        }

        Ok(storage)
    }
}
