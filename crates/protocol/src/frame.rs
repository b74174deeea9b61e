//! Framing layer: classifies every WebSocket payload into a [`Frame`].
//!
//! Inbound segments carry no type tag on the wire, so text payloads are
//! classified by shape:
//!
//! ```text
//! {"type": "result", ...}                     -> Result
//! {"type": "error", ...}                      -> Error
//! any config key (apiKey, ..., extraWsConfig) -> Config
//! chunkSize / length                          -> Metadata
//! binary payload                              -> Chunk
//! ```
//!
//! Shape and validation are separate concerns: a config-shaped object that
//! lacks `userKey` still classifies as a config, and surfaces as
//! [`ProtocolError::MissingConfigFields`].

use serde::Serialize;
use serde_json::Value;

use crate::ProtocolError;
use crate::constants::{API_KEY_ALIASES, EXTRA_CONFIG_KEY, MANDATORY_CONFIG_KEYS, METADATA_KEYS};
use crate::types::{ErrorReport, ScanConfig, ScanOutcome, TransferMetadata};

/// Every message kind exchanged during a session.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Inbound segment 1.
    Metadata(TransferMetadata),
    /// Inbound segment 2.
    Config(ScanConfig),
    /// Inbound segment 3, one piece of the archive.
    Chunk(Vec<u8>),
    /// Outbound scan result.
    Result(ScanOutcome),
    /// Outbound early error.
    Error(ErrorReport),
}

/// Raw WebSocket payload of an encoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Reply<'a> {
    Result(&'a ScanOutcome),
    Error(&'a ErrorReport),
}

impl Frame {
    /// Decodes a text payload.
    pub fn decode_text(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        let Value::Object(obj) = value else {
            return Err(ProtocolError::NotAnObject);
        };

        match obj.get("type").and_then(Value::as_str) {
            Some("result") => {
                return serde_json::from_value(Value::Object(obj))
                    .map(Frame::Result)
                    .map_err(|e| ProtocolError::InvalidJson(e.to_string()));
            }
            Some("error") => {
                return serde_json::from_value(Value::Object(obj))
                    .map(Frame::Error)
                    .map_err(|e| ProtocolError::InvalidJson(e.to_string()));
            }
            _ => {}
        }

        let config_shaped = obj.keys().any(|k| is_config_key(k));
        let metadata_shaped = obj.keys().any(|k| METADATA_KEYS.contains(&k.as_str()));

        match (config_shaped, metadata_shaped) {
            (true, false) => ScanConfig::from_object(&obj).map(Frame::Config),
            (false, true) => TransferMetadata::from_object(&obj).map(Frame::Metadata),
            (true, true) => Err(ProtocolError::MixedShape),
            (false, false) => Err(ProtocolError::Unrecognized),
        }
    }

    /// Wraps a binary payload. Binary payloads are always archive chunks.
    pub fn decode_binary(data: impl Into<Vec<u8>>) -> Self {
        Frame::Chunk(data.into())
    }

    /// Encodes this frame into its wire payload.
    pub fn into_payload(self) -> Result<Payload, serde_json::Error> {
        let text = match self {
            Frame::Chunk(data) => return Ok(Payload::Binary(data)),
            Frame::Metadata(meta) => serde_json::to_string(&meta)?,
            Frame::Config(config) => serde_json::to_string(&config)?,
            Frame::Result(outcome) => serde_json::to_string(&Reply::Result(&outcome))?,
            Frame::Error(report) => serde_json::to_string(&Reply::Error(&report))?,
        };
        Ok(Payload::Text(text))
    }

    /// Short name used in logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Frame::Metadata(_) => "metadata",
            Frame::Config(_) => "config",
            Frame::Chunk(_) => "archive chunk",
            Frame::Result(_) => "result",
            Frame::Error(_) => "error",
        }
    }
}

fn is_config_key(key: &str) -> bool {
    key == EXTRA_CONFIG_KEY
        || MANDATORY_CONFIG_KEYS.contains(&key)
        || API_KEY_ALIASES.contains(&key)
}
