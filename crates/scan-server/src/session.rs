//! Session controller: owns one connection from accept to close.

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use wsscan_protocol::constants::{CLOSE_INTERNAL, CLOSE_NORMAL, CLOSE_POLICY};
use wsscan_protocol::{ErrorKind, ErrorReport, Frame, ScanConfig, ScanOutcome};
use wsscan_scanner::ScanInvoker;
use wsscan_transfer::{ChunkReader, MaterializedArchive, SessionScratch, format_size};

use crate::decoder::{Inbound, SegmentDecoder, WsTransport, describe_text};
use crate::error::SessionError;
use crate::resources::SessionResources;

/// Protocol state of a session.
///
/// ```text
/// AwaitingMetadata -> AwaitingConfig -> ReceivingArchive -> Scanning -> Succeeded | Failed -> Closed
/// ```
///
/// Any non-terminal state may fall straight to `Failed`, and every state
/// may reach `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    AwaitingMetadata,
    AwaitingConfig,
    ReceivingArchive,
    Scanning,
    Succeeded,
    Failed,
    Closed,
}

impl SessionState {
    pub fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (AwaitingMetadata, AwaitingConfig)
            | (AwaitingConfig, ReceivingArchive)
            | (ReceivingArchive, Scanning)
            | (Scanning, Succeeded) => true,
            (Succeeded | Failed, _) => false,
            (_, Failed) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Closed)
    }
}

/// What happened during a session, returned by [`SessionController::run`].
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub id: String,
    /// Every state the session passed through, starting with `AwaitingMetadata`.
    pub transitions: Vec<SessionState>,
    /// Scan result, if the engine ran.
    pub outcome: Option<ScanOutcome>,
    /// Error kind, if the session failed before producing a result.
    pub error: Option<ErrorKind>,
    /// The peer went away before a reply could be written.
    pub disconnected: bool,
    /// Archive bytes accepted.
    pub bytes_received: u64,
}

impl SessionReport {
    pub fn final_state(&self) -> SessionState {
        self.transitions
            .last()
            .copied()
            .unwrap_or(SessionState::AwaitingMetadata)
    }

    /// True if the session passed through `state`.
    pub fn visited(&self, state: SessionState) -> bool {
        self.transitions.contains(&state)
    }
}

/// Drives one session end-to-end.
///
/// Segments are processed strictly in order; the invoker only runs once
/// the archive is materialized with exactly the declared length. Exactly
/// one reply (result or error) is written unless the peer disconnected,
/// and the session's scratch directory is removed on every path.
pub struct SessionController<S> {
    id: String,
    peer: String,
    decoder: SegmentDecoder<S>,
    resources: SessionResources,
    invoker: Arc<dyn ScanInvoker>,
    cancel: CancellationToken,
    state: SessionState,
    transitions: Vec<SessionState>,
    bytes_received: u64,
}

impl<S: WsTransport> SessionController<S> {
    pub fn new(
        id: impl Into<String>,
        peer: impl Into<String>,
        ws: S,
        resources: SessionResources,
        invoker: Arc<dyn ScanInvoker>,
        cancel: CancellationToken,
    ) -> Self {
        let read_timeout = resources.limits().read_timeout;
        Self {
            id: id.into(),
            peer: peer.into(),
            decoder: SegmentDecoder::new(ws, read_timeout),
            resources,
            invoker,
            cancel,
            state: SessionState::AwaitingMetadata,
            transitions: vec![SessionState::AwaitingMetadata],
            bytes_received: 0,
        }
    }

    /// Runs the session to completion.
    pub async fn run(self) -> SessionReport {
        let span = tracing::info_span!(
            "session",
            id = %self.id,
            peer = %self.peer,
            project = tracing::field::Empty,
        );
        self.run_inner().instrument(span).await
    }

    async fn run_inner(mut self) -> SessionReport {
        tracing::info!("session opened");
        let mut scratch: Option<SessionScratch> = None;

        let cancel = self.cancel.clone();
        let result = tokio::select! {
            r = self.drive(&mut scratch) => r,
            _ = cancel.cancelled() => Err(SessionError::Shutdown),
        };

        let mut report_outcome = None;
        let mut report_error = None;
        let mut disconnected = false;

        match result {
            Ok(outcome) => {
                let next = if outcome.is_success() {
                    SessionState::Succeeded
                } else {
                    SessionState::Failed
                };
                self.advance(next);
                tracing::info!(
                    status = ?outcome.status,
                    exit_code = ?outcome.exit_code,
                    kind = ?outcome.kind,
                    "scan finished"
                );
                match self.decoder.send_frame(Frame::Result(outcome.clone())).await {
                    Ok(()) => self.decoder.close(CLOSE_NORMAL, "scan complete").await,
                    Err(e) => {
                        tracing::warn!("failed to deliver scan result: {e}");
                        disconnected = true;
                    }
                }
                report_outcome = Some(outcome);
            }
            Err(err) => {
                self.advance(SessionState::Failed);
                let kind = err.kind();
                report_error = Some(kind);
                if err.peer_gone() {
                    tracing::info!(%kind, "peer disconnected: {err}");
                    disconnected = true;
                } else {
                    tracing::warn!(%kind, "session failed: {err}");
                    let code = if kind.is_protocol_violation() {
                        CLOSE_POLICY
                    } else {
                        CLOSE_INTERNAL
                    };
                    let report = ErrorReport::new(kind, err.to_string());
                    match self.decoder.send_frame(Frame::Error(report)).await {
                        Ok(()) => self.decoder.close(code, kind.as_str()).await,
                        Err(e) => {
                            tracing::debug!("failed to deliver error reply: {e}");
                            disconnected = true;
                        }
                    }
                }
            }
        }

        if let Some(mut scratch) = scratch {
            if let Err(e) = scratch.teardown().await {
                tracing::warn!("scratch cleanup failed: {e}");
            }
        }
        self.advance(SessionState::Closed);
        tracing::info!("session closed");

        SessionReport {
            id: self.id,
            transitions: self.transitions,
            outcome: report_outcome,
            error: report_error,
            disconnected,
            bytes_received: self.bytes_received,
        }
    }

    /// Decodes, materializes and scans. Returns the engine's outcome.
    async fn drive(
        &mut self,
        scratch: &mut Option<SessionScratch>,
    ) -> Result<ScanOutcome, SessionError> {
        let limits = *self.resources.limits();

        let meta = self.decoder.read_metadata(&limits).await?;
        tracing::debug!(
            chunk_size = meta.chunk_size,
            length = meta.length,
            chunks = meta.expected_chunks(),
            "metadata received"
        );
        self.advance(SessionState::AwaitingConfig);

        let config = self.decoder.read_config().await?;
        tracing::Span::current().record("project", config.project_name.as_str());
        tracing::debug!(extras = config.extra_ws_config.len(), "config received");
        self.advance(SessionState::ReceivingArchive);

        let area = self.resources.scratch().clone();
        let session_scratch = scratch.insert(area.open_session(&self.id).await?);
        let archive = self.receive_archive(session_scratch, meta.chunk_size, meta.length).await?;
        if let Some(inbound) = self.decoder.try_recv() {
            return Err(match inbound {
                Ok(inbound) => excess(inbound),
                Err(e) => e.for_segment("nothing"),
            });
        }
        self.advance(SessionState::Scanning);

        self.scan(&config, &archive.path).await
    }

    async fn receive_archive(
        &mut self,
        scratch: &SessionScratch,
        chunk_size: u64,
        length: u64,
    ) -> Result<MaterializedArchive, SessionError> {
        let mut writer = scratch.begin_archive(length).await?;
        let mut reader = ChunkReader::new(chunk_size, length);

        let result = reader.read_into(&mut self.decoder, &mut writer).await;
        self.bytes_received = reader.received();
        match result {
            Ok(_) => Ok(writer.finish().await?),
            Err(e) => {
                tracing::debug!("transfer aborted at {}", reader.progress().line());
                writer.abort().await;
                Err(e.into())
            }
        }
    }

    /// Waits for an invocation slot and runs the engine, watching the
    /// connection for disconnects and stray frames meanwhile.
    async fn scan(
        &mut self,
        config: &ScanConfig,
        archive: &Path,
    ) -> Result<ScanOutcome, SessionError> {
        let resources = self.resources.clone();
        let invoker = Arc::clone(&self.invoker);
        let scan_timeout = resources.limits().scan_timeout;
        let archive_size = self.bytes_received;

        let work = async {
            let _slot = resources.acquire_scan_slot().await?;
            tracing::info!(archive = %format_size(archive_size), "scan start");
            let outcome =
                match tokio::time::timeout(scan_timeout, invoker.invoke(config, archive)).await {
                    Ok(outcome) => outcome,
                    Err(_) => ScanOutcome::failure(
                        ErrorKind::ScanTimeout,
                        format!("scan engine did not finish within {scan_timeout:?}"),
                        None,
                    ),
                };
            Ok::<_, SessionError>(outcome)
        };

        tokio::select! {
            biased;
            inbound = self.decoder.recv_untimed() => Err(match inbound {
                Ok(inbound) => excess(inbound),
                Err(e) => e.for_segment("nothing"),
            }),
            r = work => r,
        }
    }

    fn advance(&mut self, next: SessionState) {
        let valid = self.state.can_advance_to(next);
        if !valid {
            tracing::error!(from = ?self.state, to = ?next, "invalid session transition");
        }
        debug_assert!(valid, "invalid session transition {:?} -> {next:?}", self.state);
        tracing::debug!(from = ?self.state, to = ?next, "state change");
        self.state = next;
        self.transitions.push(next);
    }
}

/// Error for a message arriving after the archive was complete.
fn excess(inbound: Inbound) -> SessionError {
    match inbound {
        Inbound::Closed => SessionError::Disconnected,
        Inbound::Binary(data) => SessionError::Overflow(format!(
            "{} bytes received after the archive was complete",
            data.len()
        )),
        Inbound::Text(text) => SessionError::unexpected("nothing", describe_text(&text)),
    }
}
