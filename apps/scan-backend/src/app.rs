//! Wires the engine, session resources and server together.

use std::sync::Arc;
use std::time::Duration;

use wsscan_scanner::{AgentProvisioner, ScanInvoker, UnifiedAgentInvoker};
use wsscan_server::{ScanServer, SessionResources};
use wsscan_transfer::ScratchArea;

use crate::config::Config;

/// How long shutdown waits for aborted sessions to send their reply.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs the backend until the server stops or SIGINT arrives.
pub async fn run(config: Config) -> anyhow::Result<()> {
    // -- Scan engine --
    let provisioner = Arc::new(AgentProvisioner::new(config.provision_settings()));
    match provisioner.ensure().await {
        Ok(jar) => tracing::info!(jar = %jar.display(), "scan engine ready"),
        // Sessions retry on demand and report the failure to their caller.
        Err(e) => tracing::warn!("scan engine not available yet: {e}"),
    }
    let invoker: Arc<dyn ScanInvoker> = Arc::new(UnifiedAgentInvoker::new(
        config.engine_settings(),
        Arc::clone(&provisioner),
    ));

    // -- WS server --
    let resources = SessionResources::new(
        ScratchArea::new(&config.scratch_dir),
        config.max_concurrent_scans,
        config.session_limits(),
    );
    let server = ScanServer::new(config.server_config(), resources, invoker);
    let server_run = Arc::clone(&server);
    let mut server_task = tokio::spawn(async move { server_run.run().await });

    tokio::select! {
        result = &mut server_task => {
            // The accept loop only returns early on a bind or setup failure.
            result??;
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, shutting down");
        }
    }

    // -- Graceful shutdown --
    server.shutdown();
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while server.active_sessions() > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            sessions = server.active_sessions(),
            "sessions still open after shutdown grace period"
        );
    }
    server_task.await??;
    Ok(())
}
