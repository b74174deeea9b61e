use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ProtocolError;
use crate::constants::{API_KEY_ALIASES, EXTRA_CONFIG_KEY, MANDATORY_CONFIG_KEYS};

/// First segment of a session: how the archive will be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferMetadata {
    /// Upper bound for a single archive chunk, always > 0.
    pub chunk_size: u64,
    /// Exact archive length in bytes.
    pub length: u64,
}

impl TransferMetadata {
    /// Validates raw metadata values.
    pub fn new(chunk_size: i64, length: i64) -> Result<Self, ProtocolError> {
        if chunk_size <= 0 {
            return Err(ProtocolError::MalformedMetadata(format!(
                "chunkSize must be positive, got {chunk_size}"
            )));
        }
        if length < 0 {
            return Err(ProtocolError::MalformedMetadata(format!(
                "length must not be negative, got {length}"
            )));
        }
        Ok(Self {
            chunk_size: chunk_size as u64,
            length: length as u64,
        })
    }

    /// Parses metadata from a decoded JSON object.
    pub fn from_object(obj: &Map<String, Value>) -> Result<Self, ProtocolError> {
        let chunk_size = integer_field(obj, "chunkSize")?;
        let length = integer_field(obj, "length")?;
        Self::new(chunk_size, length)
    }

    /// Number of chunks a sender using full-size chunks needs.
    pub fn expected_chunks(&self) -> u64 {
        self.length.div_ceil(self.chunk_size)
    }
}

fn integer_field(obj: &Map<String, Value>, key: &str) -> Result<i64, ProtocolError> {
    match obj.get(key) {
        None | Some(Value::Null) => Err(ProtocolError::MalformedMetadata(format!(
            "missing field `{key}`"
        ))),
        Some(v) => v.as_i64().ok_or_else(|| {
            ProtocolError::MalformedMetadata(format!("`{key}` must be an integer, got {v}"))
        }),
    }
}

/// Second segment of a session: credentials and engine options.
///
/// Only constructed through [`ScanConfig::from_object`] (or directly by
/// senders), so a decoded value always has every mandatory field set.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanConfig {
    /// Organization token. Also accepted as `organizationKey` or `orgToken`.
    pub api_key: String,
    pub product_token: String,
    pub project_name: String,
    pub requester_email: String,
    pub user_key: String,
    /// Scan service endpoint.
    pub wss_url: String,
    /// Passthrough engine options.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_ws_config: BTreeMap<String, Value>,
}

impl ScanConfig {
    /// Parses and validates a config segment.
    ///
    /// Every mandatory key that is absent, empty or not a string is reported
    /// at once in [`ProtocolError::MissingConfigFields`].
    pub fn from_object(obj: &Map<String, Value>) -> Result<Self, ProtocolError> {
        let mut missing = Vec::new();
        let mut values: [String; 6] = Default::default();

        for (slot, key) in values.iter_mut().zip(MANDATORY_CONFIG_KEYS) {
            let found = if key == "apiKey" {
                std::iter::once(key)
                    .chain(API_KEY_ALIASES)
                    .find_map(|k| non_empty_str(obj, k))
            } else {
                non_empty_str(obj, key)
            };
            match found {
                Some(v) => *slot = v.to_string(),
                None => missing.push(key),
            }
        }

        if !missing.is_empty() {
            return Err(ProtocolError::MissingConfigFields(missing));
        }

        let extra_ws_config = match obj.get(EXTRA_CONFIG_KEY) {
            None | Some(Value::Null) => BTreeMap::new(),
            Some(Value::Object(map)) => map.clone().into_iter().collect(),
            Some(other) => {
                return Err(ProtocolError::MalformedConfig(format!(
                    "`{EXTRA_CONFIG_KEY}` must be an object, got {other}"
                )));
            }
        };

        let [api_key, product_token, project_name, requester_email, user_key, wss_url] = values;
        Ok(Self {
            api_key,
            product_token,
            project_name,
            requester_email,
            user_key,
            wss_url,
            extra_ws_config,
        })
    }

    /// Iterates passthrough options with their values rendered as text.
    ///
    /// String values are emitted without quotes; everything else uses its
    /// JSON representation.
    pub fn extra_options(&self) -> impl Iterator<Item = (&str, String)> {
        self.extra_ws_config.iter().map(|(k, v)| {
            let rendered = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.as_str(), rendered)
        })
    }
}

fn non_empty_str<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

/// Terminal status of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Success,
    Failure,
}

/// Error kinds reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "MalformedMetadataError")]
    MalformedMetadata,
    #[serde(rename = "MalformedConfigError")]
    MalformedConfig,
    #[serde(rename = "UnexpectedSegmentError")]
    UnexpectedSegment,
    #[serde(rename = "MissingConfigFieldError")]
    MissingConfigField,
    #[serde(rename = "TruncatedStreamError")]
    TruncatedStream,
    #[serde(rename = "OverflowError")]
    Overflow,
    /// The received archive could not be unpacked.
    #[serde(rename = "BinaryCorruptedError")]
    BinaryCorrupted,
    #[serde(rename = "ScanTimeoutError")]
    ScanTimeout,
    #[serde(rename = "ScanInvocationError")]
    ScanInvocation,
    #[serde(rename = "ScanFailure")]
    ScanFailure,
    #[serde(rename = "InternalError")]
    Internal,
}

impl ErrorKind {
    /// Wire name of this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MalformedMetadata => "MalformedMetadataError",
            Self::MalformedConfig => "MalformedConfigError",
            Self::UnexpectedSegment => "UnexpectedSegmentError",
            Self::MissingConfigField => "MissingConfigFieldError",
            Self::TruncatedStream => "TruncatedStreamError",
            Self::Overflow => "OverflowError",
            Self::BinaryCorrupted => "BinaryCorruptedError",
            Self::ScanTimeout => "ScanTimeoutError",
            Self::ScanInvocation => "ScanInvocationError",
            Self::ScanFailure => "ScanFailure",
            Self::Internal => "InternalError",
        }
    }

    /// Returns `true` for kinds produced while decoding or receiving segments.
    pub fn is_protocol_violation(self) -> bool {
        matches!(
            self,
            Self::MalformedMetadata
                | Self::MalformedConfig
                | Self::UnexpectedSegment
                | Self::MissingConfigField
                | Self::TruncatedStream
                | Self::Overflow
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one engine run, forwarded verbatim to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanOutcome {
    pub status: ScanStatus,
    pub detail: String,
    /// Engine exit status, when the engine ran to completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Why the scan failed; absent on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}

impl ScanOutcome {
    /// Engine exited successfully.
    pub fn success(detail: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self {
            status: ScanStatus::Success,
            detail: detail.into(),
            exit_code,
            kind: None,
        }
    }

    /// Engine failed, could not be started, or timed out.
    pub fn failure(kind: ErrorKind, detail: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self {
            status: ScanStatus::Failure,
            detail: detail.into(),
            exit_code,
            kind: Some(kind),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ScanStatus::Success
    }
}

/// Early error reply for sessions that fail before scanning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorReport {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}
