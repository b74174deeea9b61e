use std::time::Duration;

use tokio_tungstenite::tungstenite::Error as WsError;

use wsscan_protocol::ErrorKind;
use wsscan_transfer::{ChunkError, TransferError};

/// Why a session ended without a scan result.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("{0}")]
    MalformedMetadata(String),

    #[error("{0}")]
    MalformedConfig(String),

    #[error("missing mandatory config field(s): {}", .0.join(", "))]
    MissingConfigField(Vec<&'static str>),

    #[error("expected {expected}, got {got}")]
    UnexpectedSegment {
        expected: &'static str,
        got: &'static str,
    },

    #[error("stream ended after {received} of {expected} archive bytes")]
    Truncated { received: u64, expected: u64 },

    #[error("no {waiting_for} received within {timeout:?}")]
    ReadTimeout {
        waiting_for: &'static str,
        timeout: Duration,
    },

    #[error("{0}")]
    Overflow(String),

    #[error("connection closed by peer")]
    Disconnected,

    #[error("server shutting down")]
    Shutdown,

    #[error("WebSocket error: {0}")]
    Transport(#[from] WsError),

    #[error("scratch storage error: {0}")]
    Scratch(#[from] TransferError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("scan slots unavailable")]
    SlotsClosed(#[from] tokio::sync::AcquireError),
}

impl SessionError {
    pub(crate) fn unexpected(expected: &'static str, got: &'static str) -> Self {
        Self::UnexpectedSegment { expected, got }
    }

    /// Wire error kind reported to the caller.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MalformedMetadata(_) => ErrorKind::MalformedMetadata,
            Self::MalformedConfig(_) => ErrorKind::MalformedConfig,
            Self::MissingConfigField(_) => ErrorKind::MissingConfigField,
            Self::UnexpectedSegment { .. } => ErrorKind::UnexpectedSegment,
            Self::Truncated { .. }
            | Self::ReadTimeout { .. }
            | Self::Disconnected
            | Self::Transport(_) => ErrorKind::TruncatedStream,
            Self::Overflow(_) => ErrorKind::Overflow,
            Self::Shutdown
            | Self::Scratch(_)
            | Self::Io(_)
            | Self::Encode(_)
            | Self::SlotsClosed(_) => ErrorKind::Internal,
        }
    }

    /// True when the peer is gone and no reply can be written.
    pub fn peer_gone(&self) -> bool {
        matches!(
            self,
            Self::Truncated { .. }
                | Self::Disconnected
                | Self::Transport(WsError::ConnectionClosed | WsError::AlreadyClosed | WsError::Io(_))
        )
    }

    /// Rewrites a malformed WebSocket frame as an error of the segment that
    /// was expected. The peer is still connected and gets a reply.
    pub(crate) fn for_segment(self, waiting_for: &'static str) -> Self {
        match self {
            Self::Transport(e @ (WsError::Utf8 | WsError::Protocol(_))) => match waiting_for {
                "metadata" => Self::MalformedMetadata(format!("invalid frame: {e}")),
                "config" => Self::MalformedConfig(format!("invalid frame: {e}")),
                _ => Self::unexpected(waiting_for, "malformed frame"),
            },
            other => other,
        }
    }
}

impl From<ChunkError<SessionError>> for SessionError {
    fn from(err: ChunkError<SessionError>) -> Self {
        match err {
            ChunkError::Truncated { received, expected } => Self::Truncated { received, expected },
            e @ (ChunkError::Overflow { .. } | ChunkError::ChunkTooLarge { .. }) => {
                Self::Overflow(e.to_string())
            }
            ChunkError::Source(e) => e,
            ChunkError::Io(e) => Self::Io(e),
        }
    }
}
