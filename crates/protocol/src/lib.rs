//! Wire protocol types for wsscan upload sessions.
//!
//! A session is one WebSocket connection carrying three inbound segments
//! (transfer metadata, scan configuration, archive chunks) and exactly one
//! outbound reply (a scan result or an early error). Every message kind is
//! represented by [`Frame`].

pub mod constants;
pub mod frame;
pub mod types;

pub use constants::{EXTRA_CONFIG_KEY, MANDATORY_CONFIG_KEYS};
pub use frame::{Frame, Payload};
pub use types::{ErrorKind, ErrorReport, ScanConfig, ScanOutcome, ScanStatus, TransferMetadata};

/// Errors produced while decoding or encoding frames.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("expected a JSON object")]
    NotAnObject,

    #[error("malformed transfer metadata: {0}")]
    MalformedMetadata(String),

    #[error("missing mandatory config field(s): {}", .0.join(", "))]
    MissingConfigFields(Vec<&'static str>),

    #[error("malformed config: {0}")]
    MalformedConfig(String),

    #[error("object mixes transfer metadata keys with config keys")]
    MixedShape,

    #[error("unrecognized segment shape")]
    Unrecognized,
}
