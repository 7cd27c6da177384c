//! One-shot atomic writes.
//!
//! A payload is written to a sibling temporary file (same directory, hence same filesystem)
//! and then moved over the target, so readers observe either the previous content or the new
//! one, never a prefix. A missing parent directory is created once and the write retried.

use crate::config::ReplaceStrategy;
use crate::error::{StorageError, StorageErrorExt};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Marker between the target name and the random suffix of an atomic-write temp file.
pub(crate) const WRITE_TMP_MARKER: &str = ".tmp";
/// Marker between the target name and the random suffix of an upload temp file.
pub(crate) const UPLOAD_TMP_MARKER: &str = ".tmp-";

const TMP_SUFFIX_LEN: usize = 16;
const TMP_ALPHABET: [char; 10] = ['0', '1', '2', '3', '4', '5', '6', '7', '8', '9'];

/// Writes whole payloads so that no partial file is ever visible at the target.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AtomicWriter {
    replace: ReplaceStrategy,
    fsync: bool,
}

impl AtomicWriter {
    pub(crate) const fn new(replace: ReplaceStrategy, fsync: bool) -> Self {
        Self { replace: replace.resolve(), fsync }
    }

    /// Overwrites `path` unconditionally.
    pub(crate) async fn write(&self, path: &Path, data: &[u8]) -> Result<(), StorageError> {
        match self.write_once(path, data).await {
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Parent directory missing, creating it");
                create_ancestors(path)
                    .await
                    .context(format!("Failed to create parent directories: {}", path.display()))?;
                self.write_once(path, data)
                    .await
                    .context(format!("Write failed: {}", path.display()))?;
            },
            result => result.context(format!("Write failed: {}", path.display()))?,
        }

        debug!(path = %path.display(), bytes = data.len(), "File saved atomically");
        Ok(())
    }

    /// Writes `path` only if it does not exist yet.
    pub(crate) async fn create(&self, path: &Path, data: &[u8]) -> Result<(), StorageError> {
        if exists(path).await? {
            return Err(StorageError::already_exists(path));
        }
        self.write(path, data).await
    }

    /// Writes `path` only if it already exists.
    pub(crate) async fn update(&self, path: &Path, data: &[u8]) -> Result<(), StorageError> {
        if !exists(path).await? {
            return Err(StorageError::not_found(path));
        }
        self.write(path, data).await
    }

    async fn write_once(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let tmp = tmp_sibling(path, WRITE_TMP_MARKER);
        write_file(&tmp, data, self.fsync, true).await?;

        match self.replace {
            ReplaceStrategy::Overwrite => {
                let written = write_file(path, data, self.fsync, false).await;
                let removed = fs::remove_file(&tmp).await;
                written.and(removed)
            },
            ReplaceStrategy::Auto | ReplaceStrategy::Rename => {
                if let Err(err) = fs::rename(&tmp, path).await {
                    let _ = fs::remove_file(&tmp).await;
                    return Err(err);
                }
                if self.fsync
                    && let Some(parent) = path.parent()
                {
                    sync_dir(parent).await;
                }
                Ok(())
            },
        }
    }
}

async fn exists(path: &Path) -> Result<bool, StorageError> {
    fs::try_exists(path).await.context(format!("Existence check failed: {}", path.display()))
}

/// Writes `data` into `path`. With `create_new` the file must not exist yet; a file left
/// half-written by a failed attempt is removed.
async fn write_file(path: &Path, data: &[u8], fsync: bool, create_new: bool) -> io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true);
    if create_new {
        options.create_new(true);
    } else {
        options.create(true).truncate(true);
    }
    let mut file = options.open(path).await?;

    let result = async {
        file.write_all(data).await?;
        file.flush().await?;
        if fsync {
            file.sync_all().await?;
        }
        Ok(())
    }
    .await;

    if result.is_err() && create_new {
        drop(file);
        let _ = fs::remove_file(path).await;
    }
    result
}

/// Builds `<target><marker><random digits>` next to `target`.
pub(crate) fn tmp_sibling(target: &Path, marker: &str) -> PathBuf {
    let suffix = nanoid::nanoid!(TMP_SUFFIX_LEN, &TMP_ALPHABET);
    let mut name = target.file_name().map_or_else(|| OsString::from("storage"), OsString::from);
    name.push(marker);
    name.push(suffix);
    target.with_file_name(name)
}

/// Returns `true` for file names produced by [`tmp_sibling`]: a non-empty stem, then `.tmp` or
/// `.tmp-`, then exactly 16 ASCII digits. Storage names of this shape are refused at resolution.
pub(crate) fn is_tmp_name(name: &str) -> bool {
    let Some(idx) = name.rfind(WRITE_TMP_MARKER) else {
        return false;
    };
    if idx == 0 {
        return false;
    }
    let suffix = &name[idx + WRITE_TMP_MARKER.len()..];
    let suffix = suffix.strip_prefix('-').unwrap_or(suffix);
    suffix.len() == TMP_SUFFIX_LEN && suffix.bytes().all(|b| b.is_ascii_digit())
}

/// Creates every missing ancestor directory of `path`, outermost first.
///
/// The ascent stops at the first existing directory, the filesystem root, or an empty /
/// `.` relative base. A directory that appears concurrently counts as created.
pub(crate) async fn create_ancestors(path: &Path) -> io::Result<()> {
    let mut missing = Vec::new();
    let mut current = path.parent();

    while let Some(dir) = current {
        if dir.as_os_str().is_empty() || dir == Path::new(".") || dir == Path::new("..") {
            break;
        }
        match fs::metadata(dir).await {
            Ok(_) => break,
            Err(err) if err.kind() == io::ErrorKind::NotFound => missing.push(dir.to_path_buf()),
            Err(err) => return Err(err),
        }
        current = dir.parent();
    }

    for dir in missing.iter().rev() {
        match fs::create_dir(dir).await {
            Ok(()) => debug!(path = %dir.display(), "Directory created"),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {},
            Err(err) => return Err(err),
        }
    }

    Ok(())
}

/// Flushes directory metadata so a completed rename survives a crash. Best-effort.
pub(crate) async fn sync_dir(path: &Path) {
    match fs::File::open(path).await {
        Ok(dir) => {
            if let Err(err) = dir.sync_all().await {
                warn!(path = %path.display(), error = %err, "Directory sync failed");
            }
        },
        Err(err) => {
            warn!(path = %path.display(), error = %err, "Directory open failed");
        },
    }
}
