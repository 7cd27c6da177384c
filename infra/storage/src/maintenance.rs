use crate::atomic::is_tmp_name;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::{error, info, warn};
use walkdir::{DirEntry, WalkDir};

/// Removes temporary files abandoned by crashed writers and uploads.
///
/// Only files matching the temp naming scheme and older than `max_age` are touched, so writers
/// still in flight in other processes keep their files. Never fails: problems are logged.
pub(crate) async fn purge_tmp(root: &Path, max_age: Duration) {
    let root = root.to_path_buf();
    let now = SystemTime::now();

    match tokio::task::spawn_blocking(move || remove_stale(&root, now, max_age)).await {
        Ok((removed, failed)) if removed > 0 || failed > 0 => {
            info!(removed, failed, "Purged stale temporary files");
        },
        Err(e) => {
            error!(error = %e, "Temporary file purge task panicked");
        },
        _ => {},
    }
}

fn remove_stale(root: &Path, now: SystemTime, max_age: Duration) -> (usize, usize) {
    let mut removed = 0;
    let mut failed = 0;

    WalkDir::new(root)
        .into_iter()
        .flatten()
        .filter(|entry| is_tmp(entry) && is_stale(entry, now, max_age))
        .for_each(|entry| match std::fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "Stale temporary file removal failed");
                failed += 1;
            },
        });

    (removed, failed)
}

fn is_tmp(entry: &DirEntry) -> bool {
    entry.file_type().is_file() && entry.file_name().to_str().is_some_and(is_tmp_name)
}

fn is_stale(entry: &DirEntry, now: SystemTime, max_age: Duration) -> bool {
    entry
        .metadata()
        .ok()
        .and_then(|m| m.modified().ok())
        .and_then(|modified| now.duration_since(modified).ok())
        .is_none_or(|age| age >= max_age)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomic::{UPLOAD_TMP_MARKER, WRITE_TMP_MARKER, tmp_sibling};
    use tempfile::TempDir;

    #[test]
    fn only_tmp_files_are_removed() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("pkg");
        std::fs::create_dir_all(dir.join("empty")).unwrap();

        let target = dir.join("package.json");
        std::fs::write(&target, b"{}").unwrap();
        let write_tmp = tmp_sibling(&target, WRITE_TMP_MARKER);
        let upload_tmp = tmp_sibling(&target, UPLOAD_TMP_MARKER);
        std::fs::write(&write_tmp, b"partial").unwrap();
        std::fs::write(&upload_tmp, b"partial").unwrap();
        std::fs::write(dir.join("notes.tmp"), b"keep").unwrap();

        let (removed, failed) = remove_stale(temp.path(), SystemTime::now(), Duration::ZERO);

        assert_eq!((removed, failed), (2, 0));
        assert!(target.exists());
        assert!(dir.join("notes.tmp").exists());
        assert!(dir.join("empty").is_dir());
        assert!(!write_tmp.exists());
        assert!(!upload_tmp.exists());
    }

    #[test]
    fn young_tmp_files_survive() {
        let temp = TempDir::new().unwrap();
        let tmp = tmp_sibling(&temp.path().join("index.json"), WRITE_TMP_MARKER);
        std::fs::write(&tmp, b"in flight").unwrap();

        let (removed, _) = remove_stale(temp.path(), SystemTime::now(), Duration::from_secs(300));

        assert_eq!(removed, 0);
        assert!(tmp.exists());
    }
}
