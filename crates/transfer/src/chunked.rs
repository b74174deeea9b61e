use std::future::Future;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::progress::TransferProgress;

/// A stream of archive chunks.
///
/// Implementors return `Ok(None)` once the underlying connection has ended.
/// Timeouts and shape violations are reported through `Self::Error`.
pub trait ChunkSource {
    type Error;

    fn next_chunk(&mut self) -> impl Future<Output = Result<Option<Vec<u8>>, Self::Error>> + Send;
}

/// Errors produced by [`ChunkReader`].
#[derive(Debug, thiserror::Error)]
pub enum ChunkError<E> {
    #[error("stream ended after {received} of {expected} bytes")]
    Truncated { received: u64, expected: u64 },

    #[error("received {received} bytes, more than the declared {expected}")]
    Overflow { received: u64, expected: u64 },

    #[error("chunk of {size} bytes exceeds the declared chunk size of {chunk_size}")]
    ChunkTooLarge { size: u64, chunk_size: u64 },

    #[error("{0}")]
    Source(E),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Accumulates exactly `total` bytes delivered in chunks of at most
/// `chunk_size` bytes.
#[derive(Debug)]
pub struct ChunkReader {
    chunk_size: u64,
    progress: TransferProgress,
    chunks: u64,
}

impl ChunkReader {
    pub fn new(chunk_size: u64, total: u64) -> Self {
        Self {
            chunk_size,
            progress: TransferProgress::new(total),
            chunks: 0,
        }
    }

    /// Bytes accepted so far.
    pub fn received(&self) -> u64 {
        self.progress.received()
    }

    /// Chunks accepted so far.
    pub fn chunks(&self) -> u64 {
        self.chunks
    }

    pub fn progress(&self) -> &TransferProgress {
        &self.progress
    }

    /// Reads the whole payload into memory.
    pub async fn read<S>(&mut self, source: &mut S) -> Result<Vec<u8>, ChunkError<S::Error>>
    where
        S: ChunkSource + Send,
    {
        let mut buf = Vec::new();
        self.read_into(source, &mut buf).await?;
        Ok(buf)
    }

    /// Reads chunks from `source` and writes them to `sink` until exactly the
    /// declared total has been received.
    ///
    /// A chunk that would exceed the total is rejected before any of its
    /// bytes reach the sink. Returns the number of bytes written.
    pub async fn read_into<S, W>(
        &mut self,
        source: &mut S,
        sink: &mut W,
    ) -> Result<u64, ChunkError<S::Error>>
    where
        S: ChunkSource + Send,
        W: AsyncWrite + Unpin + Send,
    {
        tracing::info!(
            total = self.progress.total(),
            chunk_size = self.chunk_size,
            "transfer start"
        );

        while self.progress.remaining() > 0 {
            let Some(chunk) = source.next_chunk().await.map_err(ChunkError::Source)? else {
                return Err(ChunkError::Truncated {
                    received: self.progress.received(),
                    expected: self.progress.total(),
                });
            };
            self.accept(&chunk)?;
            sink.write_all(&chunk).await?;
            self.progress.record(chunk.len() as u64);
            self.chunks += 1;
            tracing::debug!(chunk = self.chunks, "{}", self.progress.line());
        }

        sink.flush().await?;
        tracing::info!(
            chunks = self.chunks,
            elapsed_ms = self.progress.elapsed().as_millis() as u64,
            bytes_per_sec = self.progress.bytes_per_second() as u64,
            "transfer done: {}",
            self.progress.line()
        );
        Ok(self.progress.received())
    }

    fn accept<E>(&self, chunk: &[u8]) -> Result<(), ChunkError<E>> {
        let size = chunk.len() as u64;
        if size > self.chunk_size {
            return Err(ChunkError::ChunkTooLarge {
                size,
                chunk_size: self.chunk_size,
            });
        }
        let received = self.progress.received() + size;
        if received > self.progress.total() {
            return Err(ChunkError::Overflow {
                received,
                expected: self.progress.total(),
            });
        }
        Ok(())
    }
}
