//! Scan WebSocket server.
//!
//! Listens on a TCP port, upgrades HTTP GET on the configured path to
//! WebSocket and runs one [`SessionController`] per connection. Sessions
//! run concurrently; the only state they share lives in
//! [`SessionResources`].

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;

use wsscan_protocol::constants::{DEFAULT_ENDPOINT_PATH, WS_MAX_MESSAGE_SIZE};
use wsscan_scanner::ScanInvoker;

use crate::ServerError;
use crate::resources::SessionResources;
use crate::session::SessionController;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
    /// Only upgrades on this path are accepted.
    pub path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            path: DEFAULT_ENDPOINT_PATH.to_string(),
        }
    }
}

/// The scan WebSocket server.
pub struct ScanServer {
    config: ServerConfig,
    resources: SessionResources,
    invoker: Arc<dyn ScanInvoker>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
    active: AtomicUsize,
}

impl ScanServer {
    pub fn new(
        config: ServerConfig,
        resources: SessionResources,
        invoker: Arc<dyn ScanInvoker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            resources,
            invoker,
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
            active: AtomicUsize::new(0),
        })
    }

    /// Returns the local address the server is listening on.
    ///
    /// Only available after [`run`](Self::run) binds the socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Returns the listening port (0 if not yet bound).
    pub async fn port(&self) -> u16 {
        self.local_addr.lock().await.map(|a| a.port()).unwrap_or(0)
    }

    /// Sessions currently running.
    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Stops accepting connections and aborts running sessions.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the server until cancellation.
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        self.resources.scratch().prepare().await?;

        let addr = SocketAddr::new(self.config.bind, self.config.port);
        let listener = TcpListener::bind(addr).await?;

        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        tracing::info!(
            scratch = %self.resources.scratch().root().display(),
            "scan server listening on ws://{local_addr}{}",
            self.config.path
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("server shutting down");
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    tracing::warn!(%peer_addr, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Upgrades one TCP connection and runs its session to completion.
    async fn handle_connection(
        self: &Arc<Self>,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let path = self.config.path.clone();
        let check_path = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            if req.uri().path() == path {
                Ok(resp)
            } else {
                let mut err = ErrorResponse::new(Some(format!("no endpoint at {}", req.uri().path())));
                *err.status_mut() = StatusCode::NOT_FOUND;
                Err(err)
            }
        };

        // WebSocket upgrade with size limits matching our protocol constants.
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let handshake_timeout = self.resources.limits().read_timeout;
        let handshake = tokio::time::timeout(
            handshake_timeout,
            accept_hdr_async_with_config(stream, check_path, Some(ws_config)),
        );
        let ws_stream = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            result = handshake => match result {
                Ok(ws) => ws?,
                Err(_) => return Err(ServerError::HandshakeTimeout(handshake_timeout)),
            },
        };
        tracing::debug!(%peer_addr, "WebSocket connection established");

        let id = uuid::Uuid::new_v4().to_string();
        let controller = SessionController::new(
            id,
            peer_addr.to_string(),
            ws_stream,
            self.resources.clone(),
            Arc::clone(&self.invoker),
            self.cancel.child_token(),
        );

        self.active.fetch_add(1, Ordering::AcqRel);
        let report = controller.run().await;
        self.active.fetch_sub(1, Ordering::AcqRel);

        tracing::debug!(
            session = %report.id,
            state = ?report.final_state(),
            bytes = report.bytes_received,
            "session report"
        );
        Ok(())
    }
}
