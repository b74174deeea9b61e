//! Scan engine invocation.
//!
//! The session layer only sees the [`ScanInvoker`] trait. The production
//! implementation, [`UnifiedAgentInvoker`], unpacks the received archive,
//! translates a [`ScanConfig`] into the Unified Agent's configuration file
//! and command line, then runs the agent as a child process and maps its exit
//! status onto a [`ScanOutcome`].
//!
//! [`ScanConfig`]: wsscan_protocol::ScanConfig
//! [`ScanOutcome`]: wsscan_protocol::ScanOutcome

mod engine;
mod extract;
mod invoker;
mod provision;
mod unified_agent;

pub use engine::{ENGINE_CONFIG_FILE_NAME, EngineConfig};
pub use extract::{COMPONENT_DIR_NAME, ExtractError, Extracted, extract_component};
pub use invoker::{InvokeFuture, ScanInvoker};
pub use provision::{
    AGENT_JAR_NAME, AgentProvisioner, DEFAULT_AGENT_URL, DEFAULT_MAX_AGE, ProvisionSettings,
};
pub use unified_agent::{EngineSettings, UnifiedAgentInvoker};

/// Errors produced while provisioning the engine.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("download failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("engine jar not found at {0} and no download URL configured")]
    NotAvailable(String),
}
