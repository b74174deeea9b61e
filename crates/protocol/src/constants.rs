use std::time::Duration;

/// Default WebSocket path sessions are accepted on.
pub const DEFAULT_ENDPOINT_PATH: &str = "/component";

/// Maximum WebSocket message size in bytes (50 MB).
///
/// Also the upper bound for a declared `chunkSize`.
pub const WS_MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

/// Default bounded wait for a single inbound frame.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Default bounded wait for the scan engine process.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Configuration keys that must be present and non-empty.
pub const MANDATORY_CONFIG_KEYS: [&str; 6] = [
    "apiKey",
    "productToken",
    "projectName",
    "requesterEmail",
    "userKey",
    "wssUrl",
];

/// Key holding passthrough engine options.
pub const EXTRA_CONFIG_KEY: &str = "extraWsConfig";

/// Accepted input aliases for `apiKey` (the organization token).
pub const API_KEY_ALIASES: [&str; 2] = ["organizationKey", "orgToken"];

/// Keys that identify a metadata segment.
pub const METADATA_KEYS: [&str; 2] = ["chunkSize", "length"];

/// Close code sent after a result or error reply.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code sent after a protocol violation.
pub const CLOSE_POLICY: u16 = 1008;

/// Close code sent after a local server failure.
pub const CLOSE_INTERNAL: u16 = 1011;
