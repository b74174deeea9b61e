//! Segment decoder: pulls the three inbound segments off a WebSocket in
//! order and maps every out-of-place payload onto a [`SessionError`].

use std::time::Duration;

use futures_util::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::error::ProtocolError as WsProtocolError;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use wsscan_protocol::constants::MANDATORY_CONFIG_KEYS;
use wsscan_protocol::{Frame, Payload, ProtocolError, ScanConfig, TransferMetadata};
use wsscan_transfer::ChunkSource;

use crate::error::SessionError;
use crate::resources::SessionLimits;

/// How long the closing handshake may take after the reply is written.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// A WebSocket connection as seen by a session.
pub trait WsTransport:
    Stream<Item = Result<WsMessage, WsError>> + Sink<WsMessage, Error = WsError> + Unpin + Send
{
}

impl<T> WsTransport for T where
    T: Stream<Item = Result<WsMessage, WsError>> + Sink<WsMessage, Error = WsError> + Unpin + Send
{
}

/// A data message, with control frames already filtered out.
#[derive(Debug)]
pub(crate) enum Inbound {
    Text(String),
    Binary(Vec<u8>),
    Closed,
}

/// Reads segments from one connection.
///
/// Every read is bounded by the session's read timeout; an expired wait
/// surfaces as [`SessionError::ReadTimeout`].
pub struct SegmentDecoder<S> {
    ws: S,
    read_timeout: Duration,
}

impl<S: WsTransport> SegmentDecoder<S> {
    pub fn new(ws: S, read_timeout: Duration) -> Self {
        Self { ws, read_timeout }
    }

    /// Segment 1.
    pub async fn read_metadata(
        &mut self,
        limits: &SessionLimits,
    ) -> Result<TransferMetadata, SessionError> {
        let text = match self.recv("metadata").await? {
            Inbound::Text(text) => text,
            Inbound::Binary(_) => return Err(SessionError::unexpected("metadata", "archive chunk")),
            Inbound::Closed => return Err(SessionError::Disconnected),
        };

        let meta = match Frame::decode_text(&text) {
            Ok(Frame::Metadata(meta)) => meta,
            Ok(other) => return Err(SessionError::unexpected("metadata", other.name())),
            Err(ProtocolError::MissingConfigFields(_) | ProtocolError::MalformedConfig(_)) => {
                return Err(SessionError::unexpected("metadata", "config"));
            }
            Err(e) => return Err(SessionError::MalformedMetadata(e.to_string())),
        };

        if meta.chunk_size > limits.max_chunk_bytes {
            return Err(SessionError::MalformedMetadata(format!(
                "chunkSize {} exceeds the limit of {} bytes",
                meta.chunk_size, limits.max_chunk_bytes
            )));
        }
        if meta.length > limits.max_archive_bytes {
            return Err(SessionError::MalformedMetadata(format!(
                "length {} exceeds the limit of {} bytes",
                meta.length, limits.max_archive_bytes
            )));
        }
        Ok(meta)
    }

    /// Segment 2.
    pub async fn read_config(&mut self) -> Result<ScanConfig, SessionError> {
        let text = match self.recv("config").await? {
            Inbound::Text(text) => text,
            Inbound::Binary(_) => return Err(SessionError::unexpected("config", "archive chunk")),
            Inbound::Closed => return Err(SessionError::Disconnected),
        };

        match Frame::decode_text(&text) {
            Ok(Frame::Config(config)) => Ok(config),
            Ok(other) => Err(SessionError::unexpected("config", other.name())),
            Err(ProtocolError::MissingConfigFields(keys)) => {
                Err(SessionError::MissingConfigField(keys))
            }
            // No config key at all.
            Err(ProtocolError::Unrecognized) => Err(SessionError::MissingConfigField(
                MANDATORY_CONFIG_KEYS.to_vec(),
            )),
            Err(ProtocolError::MalformedMetadata(_)) => {
                Err(SessionError::unexpected("config", "metadata"))
            }
            Err(e) => Err(SessionError::MalformedConfig(e.to_string())),
        }
    }

    /// Next data message, bounded by the read timeout.
    pub(crate) async fn recv(&mut self, waiting_for: &'static str) -> Result<Inbound, SessionError> {
        match tokio::time::timeout(self.read_timeout, self.recv_untimed()).await {
            Ok(result) => result.map_err(|e| e.for_segment(waiting_for)),
            Err(_) => Err(SessionError::ReadTimeout {
                waiting_for,
                timeout: self.read_timeout,
            }),
        }
    }

    /// Next data message, waiting as long as it takes.
    ///
    /// Cancel-safe: dropping the future never loses a message.
    pub(crate) async fn recv_untimed(&mut self) -> Result<Inbound, SessionError> {
        loop {
            let msg = match self.ws.next().await {
                None
                | Some(Err(
                    WsError::ConnectionClosed
                    | WsError::AlreadyClosed
                    | WsError::Protocol(WsProtocolError::ResetWithoutClosingHandshake),
                )) => {
                    return Ok(Inbound::Closed);
                }
                Some(Err(WsError::Capacity(e))) => {
                    return Err(SessionError::Overflow(format!("message too large: {e}")));
                }
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(msg)) => msg,
            };
            match msg {
                WsMessage::Text(text) => return Ok(Inbound::Text(text.as_str().to_owned())),
                WsMessage::Binary(data) => return Ok(Inbound::Binary(data.to_vec())),
                WsMessage::Close(_) => return Ok(Inbound::Closed),
                WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
            }
        }
    }

    /// A data message that has already arrived, if any. Never waits.
    pub(crate) fn try_recv(&mut self) -> Option<Result<Inbound, SessionError>> {
        self.recv_untimed().now_or_never()
    }

    /// Writes a reply frame.
    pub async fn send_frame(&mut self, frame: Frame) -> Result<(), SessionError> {
        let msg = match frame.into_payload()? {
            Payload::Text(text) => WsMessage::Text(text.into()),
            Payload::Binary(data) => WsMessage::Binary(data.into()),
        };
        self.ws.send(msg).await?;
        Ok(())
    }

    /// Sends a close frame and waits briefly for the peer to acknowledge it.
    ///
    /// Anything the peer sends in the meantime is discarded.
    pub async fn close(&mut self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_owned().into(),
        };
        if let Err(e) = self.ws.send(WsMessage::Close(Some(frame))).await {
            tracing::debug!("close frame not sent: {e}");
            return;
        }
        let drain = async { while let Some(Ok(_)) = self.ws.next().await {} };
        if tokio::time::timeout(CLOSE_GRACE, drain).await.is_err() {
            tracing::debug!("peer did not complete the closing handshake");
        }
    }
}

impl<S: WsTransport> ChunkSource for SegmentDecoder<S> {
    type Error = SessionError;

    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, SessionError> {
        match self.recv("archive chunk").await? {
            Inbound::Binary(data) => Ok(Some(data)),
            Inbound::Text(text) => Err(SessionError::unexpected("archive chunk", describe_text(&text))),
            Inbound::Closed => Ok(None),
        }
    }
}

/// Names a text payload for error messages.
pub(crate) fn describe_text(text: &str) -> &'static str {
    match Frame::decode_text(text) {
        Ok(frame) => frame.name(),
        Err(ProtocolError::MissingConfigFields(_) | ProtocolError::MalformedConfig(_)) => "config",
        Err(ProtocolError::MalformedMetadata(_)) => "metadata",
        Err(_) => "text message",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::WebSocketStream;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use wsscan_protocol::ErrorKind;

    async fn pair(
        read_timeout: Duration,
    ) -> (
        SegmentDecoder<WebSocketStream<DuplexStream>>,
        WebSocketStream<DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(b, Role::Client, None).await;
        (SegmentDecoder::new(server, read_timeout), client)
    }

    fn text(v: serde_json::Value) -> WsMessage {
        WsMessage::Text(v.to_string().into())
    }

    fn config_json() -> serde_json::Value {
        json!({
            "apiKey": "org",
            "productToken": "prod",
            "projectName": "proj",
            "requesterEmail": "dev@example.com",
            "userKey": "user",
            "wssUrl": "https://wss.example.com/agent",
        })
    }

    #[tokio::test]
    async fn reads_segments_in_order() {
        let (mut dec, mut client) = pair(Duration::from_secs(5)).await;
        client.send(WsMessage::Ping(vec![1].into())).await.unwrap();
        client.send(text(json!({"chunkSize": 4, "length": 8}))).await.unwrap();
        client.send(text(config_json())).await.unwrap();
        client.send(WsMessage::Binary(b"ABCD".to_vec().into())).await.unwrap();

        let meta = dec.read_metadata(&SessionLimits::default()).await.unwrap();
        assert_eq!(meta.chunk_size, 4);
        let config = dec.read_config().await.unwrap();
        assert_eq!(config.user_key, "user");
        assert_eq!(dec.next_chunk().await.unwrap(), Some(b"ABCD".to_vec()));
    }

    #[tokio::test]
    async fn archive_before_metadata_is_unexpected() {
        let (mut dec, mut client) = pair(Duration::from_secs(5)).await;
        client.send(WsMessage::Binary(b"ABCD".to_vec().into())).await.unwrap();
        let err = dec.read_metadata(&SessionLimits::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedSegment);
    }

    #[tokio::test]
    async fn config_before_metadata_is_unexpected() {
        let (mut dec, mut client) = pair(Duration::from_secs(5)).await;
        let mut incomplete = config_json();
        incomplete.as_object_mut().unwrap().remove("userKey");
        client.send(text(incomplete)).await.unwrap();
        let err = dec.read_metadata(&SessionLimits::default()).await.unwrap_err();
        assert_eq!(err.to_string(), "expected metadata, got config");
    }

    #[tokio::test]
    async fn bad_metadata_is_malformed() {
        let limits = SessionLimits::default();
        for payload in ["not json", "[4, 8]", r#"{"chunkSize": 0, "length": 8}"#, "{}"] {
            let (mut dec, mut client) = pair(Duration::from_secs(5)).await;
            client.send(WsMessage::Text(payload.to_string().into())).await.unwrap();
            let err = dec.read_metadata(&limits).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::MalformedMetadata, "payload {payload:?}");
        }
    }

    #[tokio::test]
    async fn metadata_limits_apply() {
        let limits = SessionLimits {
            max_chunk_bytes: 16,
            max_archive_bytes: 64,
            ..SessionLimits::default()
        };
        let (mut dec, mut client) = pair(Duration::from_secs(5)).await;
        client.send(text(json!({"chunkSize": 32, "length": 8}))).await.unwrap();
        let err = dec.read_metadata(&limits).await.unwrap_err();
        assert!(err.to_string().contains("chunkSize 32 exceeds"));

        let (mut dec, mut client) = pair(Duration::from_secs(5)).await;
        client.send(text(json!({"chunkSize": 4, "length": 65}))).await.unwrap();
        let err = dec.read_metadata(&limits).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedMetadata);
    }

    #[tokio::test]
    async fn config_errors() {
        let mut missing = config_json();
        missing.as_object_mut().unwrap().remove("userKey");
        let cases = [
            (missing.to_string(), ErrorKind::MissingConfigField),
            ("{}".to_string(), ErrorKind::MissingConfigField),
            ("nope".to_string(), ErrorKind::MalformedConfig),
            (
                json!({"chunkSize": 4, "length": 8}).to_string(),
                ErrorKind::UnexpectedSegment,
            ),
        ];
        for (payload, kind) in cases {
            let (mut dec, mut client) = pair(Duration::from_secs(5)).await;
            client.send(WsMessage::Text(payload.clone().into())).await.unwrap();
            let err = dec.read_config().await.unwrap_err();
            assert_eq!(err.kind(), kind, "payload {payload}");
        }
    }

    #[tokio::test]
    async fn config_with_stray_length_is_malformed() {
        let (mut dec, mut client) = pair(Duration::from_secs(5)).await;
        let mut config = config_json();
        config["length"] = json!(8);
        client.send(text(config)).await.unwrap();
        let err = dec.read_config().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedConfig);
        assert!(err.to_string().contains("mixes"));
    }

    #[tokio::test]
    async fn text_during_archive_is_unexpected() {
        let (mut dec, mut client) = pair(Duration::from_secs(5)).await;
        client.send(text(config_json())).await.unwrap();
        let err = dec.next_chunk().await.unwrap_err();
        assert_eq!(err.to_string(), "expected archive chunk, got config");
    }

    #[tokio::test]
    async fn close_ends_the_stream() {
        let (mut dec, mut client) = pair(Duration::from_secs(5)).await;
        client.close(None).await.unwrap();
        assert_eq!(dec.next_chunk().await.unwrap(), None);
    }

    /// Writes a raw client text frame whose payload is not valid UTF-8.
    async fn send_invalid_utf8_text(raw: &mut DuplexStream) {
        use tokio::io::AsyncWriteExt;
        // FIN + text opcode, masked, 3-byte payload, zero mask key.
        let frame = [0x81, 0x83, 0, 0, 0, 0, 0xff, 0xfe, 0x7b];
        raw.write_all(&frame).await.unwrap();
    }

    #[tokio::test]
    async fn invalid_utf8_metadata_is_malformed() {
        let (a, mut raw) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let mut dec = SegmentDecoder::new(server, Duration::from_secs(5));

        send_invalid_utf8_text(&mut raw).await;
        let err = dec.read_metadata(&SessionLimits::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedMetadata);
        assert!(!err.peer_gone());

        // The connection is still usable for the reply.
        let report = wsscan_protocol::ErrorReport::new(err.kind(), err.to_string());
        dec.send_frame(Frame::Error(report)).await.unwrap();
    }

    #[tokio::test]
    async fn invalid_utf8_during_archive_is_unexpected() {
        let (a, mut raw) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let mut dec = SegmentDecoder::new(server, Duration::from_secs(5));

        send_invalid_utf8_text(&mut raw).await;
        let err = dec.next_chunk().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedSegment);
    }

    #[tokio::test]
    async fn dropped_peer_reads_as_closed() {
        let (mut dec, client) = pair(Duration::from_secs(5)).await;
        drop(client);
        assert!(matches!(dec.recv_untimed().await, Ok(Inbound::Closed)));
    }

    #[tokio::test]
    async fn try_recv_sees_only_arrived_messages() {
        let (mut dec, mut client) = pair(Duration::from_secs(5)).await;
        assert!(dec.try_recv().is_none());

        client.send(WsMessage::Binary(b"IJ".to_vec().into())).await.unwrap();
        match dec.try_recv() {
            Some(Ok(Inbound::Binary(data))) => assert_eq!(data, b"IJ"),
            other => panic!("expected buffered chunk, got {other:?}"),
        }
        assert!(dec.try_recv().is_none());
    }

    #[tokio::test]
    async fn stalled_reads_time_out() {
        let (mut dec, _client) = pair(Duration::from_millis(50)).await;
        let err = dec.read_metadata(&SessionLimits::default()).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::ReadTimeout {
                waiting_for: "metadata",
                ..
            }
        ));
    }
}
