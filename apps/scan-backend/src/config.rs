//! Backend configuration.
//!
//! Read from an optional TOML file; every field has a default, so an empty
//! file (or none at all) yields a working configuration. Command-line flags
//! override individual fields afterwards.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use wsscan_protocol::constants::{DEFAULT_ENDPOINT_PATH, WS_MAX_MESSAGE_SIZE};
use wsscan_scanner::{AGENT_JAR_NAME, DEFAULT_AGENT_URL, EngineSettings, ProvisionSettings};
use wsscan_server::{ServerConfig, SessionLimits};

/// Backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address to bind.
    #[serde(default = "default_bind")]
    pub bind: IpAddr,

    /// WebSocket server port (0 = auto-assign).
    #[serde(default = "default_port")]
    pub port: u16,

    /// WebSocket endpoint path.
    #[serde(default = "default_path")]
    pub path: String,

    /// Root of the per-session scratch directories.
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,

    /// Engine processes allowed to run at once.
    #[serde(default = "default_max_concurrent_scans")]
    pub max_concurrent_scans: usize,

    /// Bounded wait for each inbound segment or chunk, in seconds.
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,

    /// Bounded wait for the engine process, in seconds.
    #[serde(default = "default_scan_timeout_secs")]
    pub scan_timeout_secs: u64,

    #[serde(default = "default_max_archive_bytes")]
    pub max_archive_bytes: u64,

    /// Largest accepted `chunkSize`. Capped at the WebSocket message limit.
    #[serde(default = "default_max_chunk_bytes")]
    pub max_chunk_bytes: u64,

    #[serde(default)]
    pub engine: EngineOptions,
}

/// `[engine]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineOptions {
    #[serde(default = "default_java_path")]
    pub java_path: PathBuf,

    /// Shared copy of the Unified Agent jar.
    #[serde(default = "default_agent_jar")]
    pub agent_jar: PathBuf,

    /// Download URL for the jar. Empty disables downloads.
    #[serde(default = "default_agent_url")]
    pub agent_url: String,

    /// Jars older than this are refreshed in the background.
    #[serde(default = "default_agent_max_age_hours")]
    pub agent_max_age_hours: u64,

    #[serde(default = "default_jvm_args")]
    pub jvm_args: Vec<String>,

    /// Run `-detect` in the session directory before each scan and append
    /// the generated settings to its output.
    #[serde(default)]
    pub detect: bool,
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    8080
}

fn default_path() -> String {
    DEFAULT_ENDPOINT_PATH.into()
}

fn default_scratch_dir() -> PathBuf {
    std::env::temp_dir().join("wsscan")
}

fn default_max_concurrent_scans() -> usize {
    4
}

fn default_read_timeout_secs() -> u64 {
    60
}

fn default_scan_timeout_secs() -> u64 {
    3600
}

fn default_max_archive_bytes() -> u64 {
    8 * 1024 * 1024 * 1024
}

fn default_max_chunk_bytes() -> u64 {
    WS_MAX_MESSAGE_SIZE as u64
}

fn default_java_path() -> PathBuf {
    PathBuf::from("java")
}

fn default_agent_jar() -> PathBuf {
    std::env::temp_dir().join(AGENT_JAR_NAME)
}

fn default_agent_url() -> String {
    DEFAULT_AGENT_URL.into()
}

fn default_agent_max_age_hours() -> u64 {
    24
}

fn default_jvm_args() -> Vec<String> {
    vec!["-Xms256m".into(), "-Xmx512m".into()]
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            java_path: default_java_path(),
            agent_jar: default_agent_jar(),
            agent_url: default_agent_url(),
            agent_max_age_hours: default_agent_max_age_hours(),
            jvm_args: default_jvm_args(),
            detect: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            path: default_path(),
            scratch_dir: default_scratch_dir(),
            max_concurrent_scans: default_max_concurrent_scans(),
            read_timeout_secs: default_read_timeout_secs(),
            scan_timeout_secs: default_scan_timeout_secs(),
            max_archive_bytes: default_max_archive_bytes(),
            max_chunk_bytes: default_max_chunk_bytes(),
            engine: EngineOptions::default(),
        }
    }
}

impl Config {
    /// Loads configuration from `path`, or the defaults when no file is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Config::default());
        };
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("invalid config {}", path.display()))?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Rejects settings the server cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.path.starts_with('/'),
            "path must start with '/', got {:?}",
            self.path
        );
        anyhow::ensure!(self.max_chunk_bytes > 0, "max_chunk_bytes must be positive");
        anyhow::ensure!(self.read_timeout_secs > 0, "read_timeout_secs must be positive");
        anyhow::ensure!(self.scan_timeout_secs > 0, "scan_timeout_secs must be positive");
        Ok(())
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind: self.bind,
            port: self.port,
            path: self.path.clone(),
        }
    }

    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            scan_timeout: Duration::from_secs(self.scan_timeout_secs),
            max_chunk_bytes: self.max_chunk_bytes.min(WS_MAX_MESSAGE_SIZE as u64),
            max_archive_bytes: self.max_archive_bytes,
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            java_path: self.engine.java_path.clone(),
            jvm_args: self.engine.jvm_args.clone(),
            detect: self.engine.detect,
        }
    }

    pub fn provision_settings(&self) -> ProvisionSettings {
        ProvisionSettings {
            jar_path: self.engine.agent_jar.clone(),
            url: self.engine.agent_url.clone(),
            max_age: Duration::from_secs(self.engine.agent_max_age_hours.saturating_mul(60 * 60)),
        }
    }
}
