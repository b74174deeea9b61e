//! WebSocket upload endpoint for wsscan.
//!
//! Every accepted connection is one scan session: the [`SessionController`]
//! pulls metadata, config and archive chunks through a [`SegmentDecoder`],
//! materializes the archive in the session's scratch directory, runs the
//! [`ScanInvoker`](wsscan_scanner::ScanInvoker) and writes exactly one reply
//! back before closing.

mod client;
mod decoder;
mod error;
mod resources;
mod server;
mod session;

pub use client::{ClientError, ScanClient};
pub use decoder::{SegmentDecoder, WsTransport};
pub use error::SessionError;
pub use resources::{SessionLimits, SessionResources};
pub use server::{ScanServer, ServerConfig};
pub use session::{SessionController, SessionReport, SessionState};

/// Errors produced by the scan server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("WebSocket handshake not completed within {0:?}")]
    HandshakeTimeout(std::time::Duration),

    #[error("scratch storage error: {0}")]
    Scratch(#[from] wsscan_transfer::TransferError),
}
