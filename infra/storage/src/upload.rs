//! Two-phase streaming uploads.
//!
//! An [`UploadSession`] streams chunks into a hidden `<target>.tmp-<random>` file through a
//! single sink task, and only a successful [`UploadSession::commit`] renames that file onto the
//! target. [`UploadSession::abort`] discards it. The lifecycle is published as an
//! [`UploadState`] on a `watch` channel.

use crate::atomic::{UPLOAD_TMP_MARKER, create_ancestors, sync_dir, tmp_sibling};
use crate::error::{StorageError, StorageErrorExt};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Lifecycle of an [`UploadSession`].
///
/// `Open → Writing → Committing → Committed | CommitFailed`, or `→ Aborting → Aborted`
/// from `Open`, `Writing` or `CommitFailed`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum UploadState {
    /// The temporary file is being opened.
    Open,
    /// The sink accepts data.
    Writing,
    /// Commit requested; waiting for queued data to drain, then renaming.
    Committing,
    Committed,
    /// Draining or renaming failed. The temporary file is kept until `abort`.
    CommitFailed,
    Aborting,
    Aborted,
}

impl UploadState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::CommitFailed | Self::Aborted)
    }
}

/// How the sink task ended.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Drain {
    /// The producer side closed and every chunk reached the file.
    Complete,
    /// Abort was signalled (or the session dropped) before the queue closed.
    Cancelled,
}

type Chunk = Vec<u8>;

/// A write-then-commit-or-abort channel for one logical name.
///
/// Chunks passed to [`write`](Self::write) are applied in submission order. The bounded queue
/// in front of the sink provides backpressure: `write` returns once the sink has room for the
/// chunk. Sink failures (disk full, permissions) surface on the next call as an error, and the
/// session does not clean up on its own: call [`abort`](Self::abort).
#[derive(Debug)]
#[must_use = "An upload session must be committed or aborted"]
pub struct UploadSession {
    target: PathBuf,
    tmp: PathBuf,
    state: Arc<watch::Sender<UploadState>>,
    chunks: Option<mpsc::Sender<Chunk>>,
    cancel: Option<oneshot::Sender<()>>,
    opened: Option<oneshot::Receiver<()>>,
    sink: Option<JoinHandle<Result<Drain, StorageError>>>,
    written: Arc<AtomicU64>,
    fsync: bool,
    sink_failed: bool,
}

impl UploadSession {
    /// Starts a session for `target`.
    ///
    /// Fails with [`StorageError::AlreadyExists`] when the target exists; no temporary file is
    /// created in that case. Otherwise the sink task is spawned and starts opening the
    /// temporary file in the background.
    pub(crate) async fn start(
        target: PathBuf,
        queue_depth: usize,
        fsync: bool,
    ) -> Result<Self, StorageError> {
        let exists = fs::try_exists(&target)
            .await
            .context(format!("Existence check failed: {}", target.display()))?;
        if exists {
            return Err(StorageError::already_exists(&target));
        }

        let tmp = tmp_sibling(&target, UPLOAD_TMP_MARKER);
        let (state, _) = watch::channel(UploadState::Open);
        let state = Arc::new(state);
        let (chunks_tx, chunks_rx) = mpsc::channel(queue_depth.max(1));
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (opened_tx, opened_rx) = oneshot::channel();
        let written = Arc::new(AtomicU64::new(0));

        let sink = Sink {
            tmp: tmp.clone(),
            fsync,
            state: Arc::clone(&state),
            written: Arc::clone(&written),
        };
        let handle = tokio::spawn(sink.run(chunks_rx, cancel_rx, opened_tx));

        debug!(path = %target.display(), tmp = %tmp.display(), "Upload session started");

        Ok(Self {
            target,
            tmp,
            state,
            chunks: Some(chunks_tx),
            cancel: Some(cancel_tx),
            opened: Some(opened_rx),
            sink: Some(handle),
            written,
            fsync,
            sink_failed: false,
        })
    }

    #[must_use]
    pub fn state(&self) -> UploadState {
        *self.state.borrow()
    }

    /// Observes state transitions without holding the session.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<UploadState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn target(&self) -> &Path {
        &self.target
    }

    #[must_use]
    pub fn tmp_path(&self) -> &Path {
        &self.tmp
    }

    /// Bytes the sink has handed to the temporary file so far.
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.written.load(Ordering::Acquire)
    }

    /// Waits until the temporary file is open and the session is `Writing`.
    ///
    /// # Errors
    ///
    /// Returns the sink's error if the temporary file could not be opened, or
    /// [`StorageError::InvalidState`] once the session has moved past `Writing`.
    pub async fn ready(&mut self) -> Result<(), StorageError> {
        match self.state() {
            UploadState::Open | UploadState::Writing => {},
            state => return Err(invalid(state, "ready")),
        }

        if let Some(opened) = self.opened.take()
            && opened.await.is_err()
        {
            return Err(self.sink_failure().await);
        }

        if self.sink_failed {
            return Err(StorageError::invalid_state("Upload sink failed earlier"));
        }
        Ok(())
    }

    /// Queues `chunk` behind every previously written chunk.
    ///
    /// # Errors
    ///
    /// Returns the sink's error if it stopped (e.g. disk full), or
    /// [`StorageError::InvalidState`] outside `Open`/`Writing`.
    pub async fn write(&mut self, chunk: impl Into<Vec<u8>>) -> Result<(), StorageError> {
        match self.state() {
            UploadState::Open | UploadState::Writing => {},
            state => return Err(invalid(state, "write")),
        }
        if self.sink_failed {
            return Err(StorageError::invalid_state("Upload sink failed earlier"));
        }

        let Some(chunks) = self.chunks.as_ref() else {
            return Err(StorageError::invalid_state("Upload producer already closed"));
        };
        if chunks.send(chunk.into()).await.is_err() {
            return Err(self.sink_failure().await);
        }
        Ok(())
    }

    /// Closes the producer side, waits for the sink to drain, then renames the temporary file
    /// onto the target.
    ///
    /// Allowed from `Open` (the pending open completes first) or `Writing`.
    ///
    /// # Errors
    ///
    /// On a drain or rename failure the session ends in `CommitFailed` and the temporary file
    /// stays on disk; [`abort`](Self::abort) removes it.
    pub async fn commit(&mut self) -> Result<(), StorageError> {
        match self.state() {
            UploadState::Open | UploadState::Writing => {},
            state => return Err(invalid(state, "commit")),
        }
        if self.sink_failed {
            return Err(StorageError::invalid_state("Upload sink failed earlier"));
        }

        self.transition(UploadState::Committing);
        drop(self.chunks.take());

        let drained = match self.sink.take() {
            Some(sink) => join_sink(sink).await,
            None => Err(StorageError::invalid_state("Upload sink already finished")),
        };
        match drained {
            Ok(Drain::Complete) => {},
            Ok(Drain::Cancelled) => {
                self.transition(UploadState::CommitFailed);
                return Err(StorageError::invalid_state("Upload sink was cancelled"));
            },
            Err(err) => {
                self.transition(UploadState::CommitFailed);
                return Err(err);
            },
        }

        if let Err(err) = fs::rename(&self.tmp, &self.target).await {
            self.transition(UploadState::CommitFailed);
            return Err(StorageError::Io {
                source: err,
                context: Some(
                    format!("Commit failed: {} -> {}", self.tmp.display(), self.target.display())
                        .into(),
                ),
            });
        }

        if self.fsync
            && let Some(parent) = self.target.parent()
        {
            sync_dir(parent).await;
        }

        self.transition(UploadState::Committed);
        debug!(path = %self.target.display(), bytes = self.bytes_written(), "Upload committed");
        Ok(())
    }

    /// Stops the sink and deletes the temporary file.
    ///
    /// Allowed from `Open`, `Writing` and `CommitFailed`. An open still in flight completes
    /// before the file is deleted; deletion errors are ignored, including a file that was
    /// never created.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidState`] from any other state.
    pub async fn abort(&mut self) -> Result<(), StorageError> {
        match self.state() {
            UploadState::Open | UploadState::Writing | UploadState::CommitFailed => {},
            state => return Err(invalid(state, "abort")),
        }

        self.transition(UploadState::Aborting);
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        drop(self.chunks.take());
        if let Some(sink) = self.sink.take()
            && let Err(err) = join_sink(sink).await
        {
            debug!(path = %self.target.display(), error = %err, "Sink error ignored on abort");
        }

        if let Err(err) = fs::remove_file(&self.tmp).await
            && err.kind() != io::ErrorKind::NotFound
        {
            debug!(tmp = %self.tmp.display(), error = %err, "Temporary file cleanup failed");
        }

        self.transition(UploadState::Aborted);
        debug!(path = %self.target.display(), "Upload aborted");
        Ok(())
    }

    fn transition(&self, next: UploadState) {
        let previous = self.state.send_replace(next);
        debug!(path = %self.target.display(), ?previous, ?next, "Upload state changed");
    }

    /// Collects the error of a sink that stopped on its own.
    async fn sink_failure(&mut self) -> StorageError {
        self.sink_failed = true;
        match self.sink.take() {
            Some(sink) => match join_sink(sink).await {
                Err(err) => err,
                Ok(_) => StorageError::invalid_state("Upload sink stopped unexpectedly"),
            },
            None => StorageError::invalid_state("Upload sink failed earlier"),
        }
    }
}

impl Drop for UploadSession {
    fn drop(&mut self) {
        let state = self.state();
        if !state.is_terminal() {
            warn!(
                path = %self.target.display(),
                ?state,
                "Upload session dropped before commit or abort"
            );
        }
    }
}

fn invalid(state: UploadState, operation: &'static str) -> StorageError {
    StorageError::InvalidState {
        message: format!("cannot {operation} an upload in state {state:?}").into(),
        context: None,
    }
}

async fn join_sink(sink: JoinHandle<Result<Drain, StorageError>>) -> Result<Drain, StorageError> {
    sink.await.map_err(|err| StorageError::Internal {
        message: err.to_string().into(),
        context: Some("Upload sink task failed".into()),
    })?
}

/// The single consumer that owns the temporary file.
struct Sink {
    tmp: PathBuf,
    fsync: bool,
    state: Arc<watch::Sender<UploadState>>,
    written: Arc<AtomicU64>,
}

impl Sink {
    async fn run(
        self,
        mut chunks: mpsc::Receiver<Chunk>,
        mut cancel: oneshot::Receiver<()>,
        opened: oneshot::Sender<()>,
    ) -> Result<Drain, StorageError> {
        let file = self.open().await?;
        self.state.send_if_modified(|state| {
            if *state == UploadState::Open {
                *state = UploadState::Writing;
                true
            } else {
                false
            }
        });
        let _ = opened.send(());

        let mut out = BufWriter::new(file);
        loop {
            tokio::select! {
                biased;
                _ = &mut cancel => return Ok(Drain::Cancelled),
                chunk = chunks.recv() => match chunk {
                    Some(chunk) => {
                        out.write_all(&chunk)
                            .await
                            .context(format!("Upload write failed: {}", self.tmp.display()))?;
                        self.written.fetch_add(chunk.len() as u64, Ordering::AcqRel);
                    },
                    None => break,
                },
            }
        }

        out.flush().await.context(format!("Upload flush failed: {}", self.tmp.display()))?;
        let file = out.into_inner();
        if self.fsync {
            file.sync_all()
                .await
                .context(format!("Upload sync failed: {}", self.tmp.display()))?;
        }
        Ok(Drain::Complete)
    }

    async fn open(&self) -> Result<fs::File, StorageError> {
        let open = || async {
            fs::OpenOptions::new().write(true).create_new(true).open(&self.tmp).await
        };

        match open().await {
            Ok(file) => Ok(file),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                create_ancestors(&self.tmp)
                    .await
                    .context(format!("Failed to create parent directories: {}", self.tmp.display()))?;
                open().await.context(format!("Upload open failed: {}", self.tmp.display()))
            },
            Err(err) => Err(StorageError::Io {
                source: err,
                context: Some(format!("Upload open failed: {}", self.tmp.display()).into()),
            }),
        }
    }
}
