//! Session-scoped scratch storage for materialized archives.

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use sha2::{Digest, Sha256};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};

use crate::{ARCHIVE_FILE_NAME, PART_SUFFIX, TransferError};

/// Write buffer for the archive file (256 KB).
const WRITE_BUFFER_SIZE: usize = 256 * 1024;

/// Process-wide scratch root, partitioned into one directory per session.
#[derive(Debug, Clone)]
pub struct ScratchArea {
    root: PathBuf,
}

impl ScratchArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the scratch root if needed.
    pub async fn prepare(&self) -> Result<(), TransferError> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    /// Creates the directory owned by `session_id`.
    ///
    /// Fails if the id could escape the root or the directory already exists,
    /// so two sessions never share a path.
    pub async fn open_session(&self, session_id: &str) -> Result<SessionScratch, TransferError> {
        validate_session_id(session_id)?;
        tokio::fs::create_dir_all(&self.root).await?;
        let dir = self.root.join(session_id);
        tokio::fs::create_dir(&dir).await?;
        tracing::debug!(path = %dir.display(), "session scratch created");
        Ok(SessionScratch {
            dir,
            torn_down: false,
        })
    }
}

fn validate_session_id(id: &str) -> Result<(), TransferError> {
    let valid = !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(TransferError::InvalidSessionId(id.to_string()))
    }
}

/// Scratch directory of one session.
///
/// Removed by [`teardown`](Self::teardown); dropping an instance that was
/// never torn down removes the directory synchronously.
#[derive(Debug)]
pub struct SessionScratch {
    dir: PathBuf,
    torn_down: bool,
}

/// A fully written archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializedArchive {
    pub path: PathBuf,
    pub size: u64,
    /// Hex SHA-256 of the archive bytes.
    pub sha256: String,
}

impl SessionScratch {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Final archive path. Only exists after [`ArchiveWriter::finish`].
    pub fn archive_path(&self) -> PathBuf {
        self.dir.join(ARCHIVE_FILE_NAME)
    }

    fn part_path(&self) -> PathBuf {
        self.dir.join(format!("{ARCHIVE_FILE_NAME}{PART_SUFFIX}"))
    }

    /// Opens the archive part file, expecting exactly `expected` bytes.
    pub async fn begin_archive(&self, expected: u64) -> Result<ArchiveWriter, TransferError> {
        let part_path = self.part_path();
        let file = tokio::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&part_path)
            .await?;
        Ok(ArchiveWriter {
            file: BufWriter::with_capacity(WRITE_BUFFER_SIZE, file),
            part_path,
            final_path: self.archive_path(),
            expected,
            written: 0,
            hasher: Sha256::new(),
        })
    }

    /// Writes `bytes` as this session's archive in one go.
    pub async fn materialize(&self, bytes: &[u8]) -> Result<MaterializedArchive, TransferError> {
        let mut writer = self.begin_archive(bytes.len() as u64).await?;
        writer.write_all(bytes).await?;
        writer.finish().await
    }

    /// Removes the session directory.
    ///
    /// Returns `Ok(false)` when the directory was already removed by an
    /// earlier call.
    pub async fn teardown(&mut self) -> Result<bool, TransferError> {
        if self.torn_down {
            return Ok(false);
        }
        self.torn_down = true;
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tracing::debug!(path = %self.dir.display(), "session scratch removed");
        Ok(true)
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }
}

impl Drop for SessionScratch {
    fn drop(&mut self) {
        if self.torn_down {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %self.dir.display(), "failed to remove session scratch: {e}");
            }
        }
    }
}

/// Streams archive bytes into the session's part file.
///
/// Bytes are hashed as they are written. [`finish`](Self::finish) renames
/// the part file to the final archive path only if exactly the expected
/// number of bytes was written.
pub struct ArchiveWriter {
    file: BufWriter<tokio::fs::File>,
    part_path: PathBuf,
    final_path: PathBuf,
    expected: u64,
    written: u64,
    hasher: Sha256,
}

impl ArchiveWriter {
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flushes to disk and publishes the archive under its final path.
    pub async fn finish(mut self) -> Result<MaterializedArchive, TransferError> {
        if self.written != self.expected {
            let (written, expected) = (self.written, self.expected);
            self.abort().await;
            return Err(TransferError::LengthMismatch { written, expected });
        }

        self.file.flush().await?;
        self.file.get_ref().sync_all().await?;
        tokio::fs::rename(&self.part_path, &self.final_path).await?;

        let sha256 = hex::encode(self.hasher.finalize());
        tracing::info!(
            path = %self.final_path.display(),
            size = self.written,
            %sha256,
            "archive materialized"
        );
        Ok(MaterializedArchive {
            path: self.final_path,
            size: self.written,
            sha256,
        })
    }

    /// Discards the partially written archive.
    pub async fn abort(self) {
        let part_path = self.part_path;
        drop(self.file);
        if let Err(e) = tokio::fs::remove_file(&part_path).await {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %part_path.display(), "failed to remove partial archive: {e}");
            }
        }
    }
}

impl AsyncWrite for ArchiveWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        match Pin::new(&mut this.file).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.hasher.update(&buf[..n]);
                this.written += n as u64;
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_shutdown(cx)
    }
}
