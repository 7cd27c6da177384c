use crate::atomic::is_tmp_name;
use crate::error::StorageError;
use std::path::{Component, Path, PathBuf};

/// Collapses `.` / `..` lexically. `..` may not climb above the (empty) relative base.
fn normalize_relative(name: &Path) -> Result<PathBuf, StorageError> {
    let mut out = PathBuf::new();

    for c in name.components() {
        match c {
            Component::CurDir => {},
            Component::Normal(seg) => out.push(seg),
            Component::ParentDir => {
                if !out.pop() {
                    return Err(traversal(name, "Name escapes the storage root via '..'"));
                }
            },
            Component::RootDir | Component::Prefix(_) => {
                return Err(traversal(name, "Absolute names are not allowed"));
            },
        }
    }

    Ok(out)
}

/// Maps a logical name to `root/name`, refusing anything that would land outside `root`.
///
/// Final components ending in `.tmp` or `.tmp-` plus 16 digits are reserved for temporary
/// files, which the stale-temp purge deletes, and are refused as well.
///
/// `root` must already be canonical. The returned path is the lexical join, so temporary and
/// sentinel siblings derived from it stay next to the name the caller asked for. Existing
/// components are canonicalized to catch symlinks pointing out of the root.
pub(crate) fn resolve_path(root: &Path, name: impl AsRef<Path>) -> Result<PathBuf, StorageError> {
    let name = name.as_ref();

    let relative = normalize_relative(name)?;
    if relative.as_os_str().is_empty() {
        return Err(traversal(name, "Name resolves to the storage root itself"));
    }
    if relative.file_name().and_then(|n| n.to_str()).is_some_and(is_tmp_name) {
        return Err(traversal(name, "Name carries the reserved temporary-file suffix"));
    }
    let joined = root.join(relative);

    match joined.canonicalize() {
        Ok(canonical) if canonical.starts_with(root) => Ok(joined),
        Ok(canonical) => Err(traversal(&canonical, "Name is a symlink leading out of the root")),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => validate_ancestors(root, joined),
        Err(e) => Err(StorageError::Io {
            source: e,
            context: Some(format!("Failed to resolve {}", joined.display()).into()),
        }),
    }
}

/// Checks a not-yet-existing path through its nearest existing ancestor.
fn validate_ancestors(root: &Path, joined: PathBuf) -> Result<PathBuf, StorageError> {
    let mut current = joined.parent();

    while let Some(dir) = current {
        if dir == root {
            return Ok(joined);
        }

        match dir.canonicalize() {
            Ok(canonical) if canonical.starts_with(root) => return Ok(joined),
            Ok(canonical) => {
                return Err(traversal(
                    &canonical,
                    "Existing parent directory is a symlink outside the root",
                ));
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => current = dir.parent(),
            Err(e) => {
                return Err(StorageError::Io {
                    source: e,
                    context: Some("Failed to verify parent directory".into()),
                });
            },
        }
    }

    Err(traversal(&joined, "No parent directory found within the root"))
}

fn traversal(path: &Path, reason: &'static str) -> StorageError {
    StorageError::PathTraversalAttempt {
        message: path.display().to_string().into(),
        context: Some(reason.into()),
    }
}
