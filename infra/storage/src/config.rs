use crate::error::StorageError;
use serde::Deserialize;
use std::time::Duration;

const DEFAULT_LOCK_RETRIES: u32 = 4;
const DEFAULT_LOCK_BACKOFF_MS: u64 = 10;
const DEFAULT_UPLOAD_QUEUE_DEPTH: usize = 64;
const DEFAULT_TMP_MAX_AGE_SECS: u64 = 300;

/// Which advisory lock provider guards `lock_and_read`.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStrategy {
    /// Probe the root once at connect time and prefer the native lock.
    #[default]
    Auto,
    /// `flock` on Unix, `LockFileEx` on Windows.
    Native,
    /// `<path>.lock` sentinel files. Best-effort only.
    Sentinel,
}

/// How a finished temporary file replaces its target.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceStrategy {
    /// `Rename`; `std::fs::rename` replaces an existing target on every supported platform.
    #[default]
    Auto,
    /// Atomic rename over the destination.
    Rename,
    /// Write the payload straight into the destination, then drop the temporary file.
    ///
    /// Not atomic: a crash in the middle of the write leaves a partial destination.
    Overwrite,
}

impl ReplaceStrategy {
    pub(crate) const fn resolve(self) -> Self {
        match self {
            Self::Auto | Self::Rename => Self::Rename,
            Self::Overwrite => Self::Overwrite,
        }
    }
}

/// Tunables of a storage root.
///
/// Every field has a default, so the struct can be embedded in a host service's
/// configuration file and only the overridden keys need to be spelled out.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Create the root directory on connect when it is missing.
    pub create: bool,
    /// `fsync` temporary files before they replace a target, and sync parent directories after.
    pub fsync: bool,
    /// Retries after the first lock attempt.
    pub lock_retries: u32,
    /// Delay before the first retry; doubled after every failed attempt.
    pub lock_backoff_ms: u64,
    pub lock_strategy: LockStrategy,
    pub replace_strategy: ReplaceStrategy,
    /// Chunks an upload session buffers before `write` waits for the sink.
    pub upload_queue_depth: usize,
    /// Remove stale temporary files left by crashed writers when connecting.
    pub purge_tmp: bool,
    pub tmp_max_age_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            create: true,
            fsync: true,
            lock_retries: DEFAULT_LOCK_RETRIES,
            lock_backoff_ms: DEFAULT_LOCK_BACKOFF_MS,
            lock_strategy: LockStrategy::Auto,
            replace_strategy: ReplaceStrategy::Auto,
            upload_queue_depth: DEFAULT_UPLOAD_QUEUE_DEPTH,
            purge_tmp: true,
            tmp_max_age_secs: DEFAULT_TMP_MAX_AGE_SECS,
        }
    }
}

impl StorageConfig {
    #[must_use]
    pub const fn lock_backoff(&self) -> Duration {
        Duration::from_millis(self.lock_backoff_ms)
    }

    #[must_use]
    pub const fn tmp_max_age(&self) -> Duration {
        Duration::from_secs(self.tmp_max_age_secs)
    }

    pub(crate) fn validate(&self) -> Result<(), StorageError> {
        if self.upload_queue_depth == 0 {
            return Err(StorageError::InvalidState {
                message: "upload_queue_depth must be greater than zero".into(),
                context: Some("Invalid storage configuration".into()),
            });
        }
        Ok(())
    }
}
