//! Process-wide resources handed to every session.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

use wsscan_protocol::constants::{DEFAULT_READ_TIMEOUT, DEFAULT_SCAN_TIMEOUT, WS_MAX_MESSAGE_SIZE};
use wsscan_transfer::ScratchArea;

/// Per-session bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    /// Bounded wait for each inbound segment or chunk.
    pub read_timeout: Duration,
    /// Bounded wait for the engine process.
    pub scan_timeout: Duration,
    /// Largest accepted `chunkSize`.
    pub max_chunk_bytes: u64,
    /// Largest accepted `length`.
    pub max_archive_bytes: u64,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            max_chunk_bytes: WS_MAX_MESSAGE_SIZE as u64,
            max_archive_bytes: 8 * 1024 * 1024 * 1024,
        }
    }
}

/// Shared handle injected into each [`SessionController`](crate::SessionController).
///
/// Holds the only state sessions share: the scratch namespace and the pool
/// of engine invocation slots. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct SessionResources {
    scratch: ScratchArea,
    scan_slots: Arc<Semaphore>,
    limits: SessionLimits,
}

impl SessionResources {
    /// `max_concurrent_scans` is clamped to at least one slot.
    pub fn new(scratch: ScratchArea, max_concurrent_scans: usize, limits: SessionLimits) -> Self {
        Self {
            scratch,
            scan_slots: Arc::new(Semaphore::new(max_concurrent_scans.max(1))),
            limits,
        }
    }

    pub fn scratch(&self) -> &ScratchArea {
        &self.scratch
    }

    pub fn limits(&self) -> &SessionLimits {
        &self.limits
    }

    /// Waits for a free engine invocation slot.
    pub async fn acquire_scan_slot(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        Arc::clone(&self.scan_slots).acquire_owned().await
    }

    /// Slots not currently held by a running scan.
    pub fn available_scan_slots(&self) -> usize {
        self.scan_slots.available_permits()
    }
}
