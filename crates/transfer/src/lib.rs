//! Chunked archive reception and session-scoped scratch storage.
//!
//! [`ChunkReader`] pulls archive chunks from a [`ChunkSource`] and enforces
//! the declared length exactly. [`ScratchArea`] hands out one directory per
//! session; the archive is written through an [`ArchiveWriter`] and only
//! appears under its final name once every byte has been flushed.

mod chunked;
mod progress;
mod scratch;

pub use chunked::{ChunkError, ChunkReader, ChunkSource};
pub use progress::{TransferProgress, format_size};
pub use scratch::{ArchiveWriter, MaterializedArchive, ScratchArea, SessionScratch};

/// File name of the materialized archive inside a session directory.
pub const ARCHIVE_FILE_NAME: &str = "archive.tar";

/// Suffix used while the archive is still being written.
pub const PART_SUFFIX: &str = ".part";

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive length mismatch: wrote {written} bytes, expected {expected}")]
    LengthMismatch { written: u64, expected: u64 },

    #[error("invalid session id: {0}")]
    InvalidSessionId(String),
}
