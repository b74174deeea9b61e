//! Minimal client for submitting an archive to a scan server.

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

use wsscan_protocol::{Frame, Payload, ProtocolError, ScanConfig, TransferMetadata};

/// Default archive chunk size (1 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid reply: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("connection closed without a reply")]
    NoReply,

    #[error("unexpected {0} reply")]
    UnexpectedReply(&'static str),
}

/// Submits one archive per connection and waits for the reply.
#[derive(Debug, Clone)]
pub struct ScanClient {
    url: String,
    chunk_size: u64,
}

impl ScanClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Sets the chunk size announced in the metadata segment.
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Sends metadata, config and archive, then returns the server's reply:
    /// [`Frame::Result`] or [`Frame::Error`].
    ///
    /// If the server rejects the session early, sending stops and the early
    /// error reply is returned.
    pub async fn submit(&self, config: &ScanConfig, archive: &[u8]) -> Result<Frame, ClientError> {
        let (mut ws, _) = tokio_tungstenite::connect_async(&self.url).await?;

        let meta = TransferMetadata {
            chunk_size: self.chunk_size,
            length: archive.len() as u64,
        };
        let mut segments = vec![Frame::Metadata(meta), Frame::Config(config.clone())];
        segments.extend(
            archive
                .chunks(self.chunk_size as usize)
                .map(|c| Frame::Chunk(c.to_vec())),
        );

        for frame in segments {
            let msg = match frame.into_payload()? {
                Payload::Text(text) => WsMessage::Text(text.into()),
                Payload::Binary(data) => WsMessage::Binary(data.into()),
            };
            if let Err(e) = ws.send(msg).await {
                tracing::debug!("send interrupted: {e}");
                break;
            }
        }

        let reply = loop {
            match ws.next().await {
                Some(Ok(WsMessage::Text(text))) => break Frame::decode_text(text.as_str())?,
                Some(Ok(WsMessage::Close(_))) | None => return Err(ClientError::NoReply),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        };

        match reply {
            Frame::Result(_) | Frame::Error(_) => {
                let _ = ws.close(None).await;
                Ok(reply)
            }
            other => Err(ClientError::UnexpectedReply(other.name())),
        }
    }
}
