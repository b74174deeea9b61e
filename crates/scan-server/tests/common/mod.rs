#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use wsscan_protocol::{ScanConfig, ScanOutcome};
use wsscan_scanner::{EngineConfig, InvokeFuture, ScanInvoker};
use wsscan_server::{ScanServer, ServerConfig, SessionLimits, SessionResources};
use wsscan_transfer::ScratchArea;

/// One recorded engine call.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Engine properties the real invoker would write.
    pub properties: BTreeMap<String, String>,
    pub archive: Vec<u8>,
}

/// Stub engine: records every call and returns a fixed outcome.
pub struct RecordingInvoker {
    outcome: ScanOutcome,
    delay: Duration,
    calls: Mutex<Vec<Invocation>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl RecordingInvoker {
    pub fn new(outcome: ScanOutcome) -> Arc<Self> {
        Self::with_delay(outcome, Duration::ZERO)
    }

    pub fn with_delay(outcome: ScanOutcome, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            outcome,
            delay,
            calls: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    /// Highest number of scans observed running at once.
    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

impl ScanInvoker for RecordingInvoker {
    fn invoke<'a>(&'a self, config: &'a ScanConfig, archive: &'a Path) -> InvokeFuture<'a> {
        Box::pin(async move {
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(running, Ordering::SeqCst);
            self.calls.lock().unwrap().push(Invocation {
                properties: EngineConfig::from_scan_config(config).properties().clone(),
                archive: std::fs::read(archive).unwrap(),
            });
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.outcome.clone()
        })
    }
}

/// A running server on a loopback port.
pub struct TestServer {
    pub server: Arc<ScanServer>,
    pub url: String,
    scratch_root: PathBuf,
    handle: JoinHandle<()>,
    _tmp: TempDir,
}

impl TestServer {
    pub async fn start(invoker: Arc<dyn ScanInvoker>) -> Self {
        Self::start_with(invoker, 4, SessionLimits::default()).await
    }

    pub async fn start_with(
        invoker: Arc<dyn ScanInvoker>,
        max_concurrent_scans: usize,
        limits: SessionLimits,
    ) -> Self {
        let tmp = TempDir::new().unwrap();
        let scratch_root = tmp.path().join("scratch");
        let resources = SessionResources::new(
            ScratchArea::new(&scratch_root),
            max_concurrent_scans,
            limits,
        );
        let config = ServerConfig {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..ServerConfig::default()
        };
        let server = ScanServer::new(config, resources, invoker);
        let server2 = Arc::clone(&server);
        let handle = tokio::spawn(async move {
            server2.run().await.unwrap();
        });

        // Wait for the server to bind.
        let mut port = 0;
        for _ in 0..100 {
            port = server.port().await;
            if port != 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(port > 0, "server did not bind");

        Self {
            server,
            url: format!("ws://127.0.0.1:{port}/component"),
            scratch_root,
            handle,
            _tmp: tmp,
        }
    }

    /// Entries left in the scratch root.
    pub fn scratch_entries(&self) -> usize {
        std::fs::read_dir(&self.scratch_root)
            .map(|d| d.count())
            .unwrap_or(0)
    }

    /// Waits until every session has finished.
    pub async fn idle(&self) {
        for _ in 0..200 {
            if self.server.active_sessions() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("sessions still running");
    }

    pub async fn stop(self) {
        self.server.shutdown();
        self.handle.await.unwrap();
    }
}

pub fn config_json() -> serde_json::Value {
    json!({
        "apiKey": "org-token",
        "extraWsConfig": {"foo": "bar"},
        "productToken": "prod-token",
        "projectName": "my-component",
        "requesterEmail": "dev@example.com",
        "userKey": "user-key",
        "wssUrl": "https://saas.example.com/agent",
    })
}

pub fn scan_config() -> ScanConfig {
    ScanConfig::from_object(config_json().as_object().unwrap()).unwrap()
}
