//! Translation of a [`ScanConfig`] into the Unified Agent's configuration.

use std::collections::BTreeMap;
use std::path::Path;

use tokio::io::AsyncWriteExt;
use wsscan_protocol::ScanConfig;

/// Name of the generated properties file inside the session directory.
pub const ENGINE_CONFIG_FILE_NAME: &str = "wss-generated-file.config";

/// Settings every scan runs with. Passthrough options may override these.
const FIXED_PROPERTIES: [(&str, &str); 5] = [
    ("go.collectDependenciesAtRuntime", "true"),
    ("failErrorLevel", "ALL"),
    ("fileSystemScan", "true"),
    ("resolveAllDependencies", "true"),
    ("python.installVirtualEnv", "true"),
];

/// Mandatory field → (engine property, engine command-line flag).
struct Binding {
    wire: &'static str,
    property: &'static str,
    flag: Option<&'static str>,
}

const BINDINGS: [Binding; 6] = [
    Binding {
        wire: "apiKey",
        property: "apiKey",
        flag: Some("-apiKey"),
    },
    Binding {
        wire: "userKey",
        property: "userKey",
        flag: Some("-userKey"),
    },
    Binding {
        wire: "wssUrl",
        property: "wss.url",
        flag: Some("-wss.url"),
    },
    Binding {
        wire: "productToken",
        property: "productToken",
        flag: Some("-productToken"),
    },
    Binding {
        wire: "projectName",
        property: "projectName",
        flag: Some("-project"),
    },
    Binding {
        wire: "requesterEmail",
        property: "requesterEmail",
        flag: None,
    },
];

fn binding_value<'a>(config: &'a ScanConfig, wire: &str) -> &'a str {
    match wire {
        "apiKey" => &config.api_key,
        "userKey" => &config.user_key,
        "wssUrl" => &config.wss_url,
        "productToken" => &config.product_token,
        "projectName" => &config.project_name,
        _ => &config.requester_email,
    }
}

fn is_reserved(key: &str) -> bool {
    BINDINGS
        .iter()
        .any(|b| b.wire == key || b.property == key || b.flag.is_some_and(|f| &f[1..] == key))
}

/// Engine configuration for one scan: properties file contents plus
/// command-line parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    properties: BTreeMap<String, String>,
    arguments: Vec<String>,
    dropped: Vec<String>,
}

impl EngineConfig {
    /// Maps mandatory fields to engine names and merges passthrough options.
    ///
    /// Passthrough keys naming a mandatory field (under its wire name, its
    /// engine property or its flag) are dropped.
    pub fn from_scan_config(config: &ScanConfig) -> Self {
        let mut properties: BTreeMap<String, String> = FIXED_PROPERTIES
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut dropped = Vec::new();

        for (key, value) in config.extra_options() {
            if is_reserved(key) {
                dropped.push(key.to_string());
                continue;
            }
            properties.insert(key.to_string(), value);
        }

        let mut arguments = Vec::new();
        for binding in &BINDINGS {
            let value = binding_value(config, binding.wire);
            properties.insert(binding.property.to_string(), value.to_string());
            if let Some(flag) = binding.flag {
                arguments.push(flag.to_string());
                arguments.push(value.to_string());
            }
        }

        Self {
            properties,
            arguments,
            dropped,
        }
    }

    /// Resolved engine properties keyed by engine name.
    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Command-line parameters (`-apiKey <v> -userKey <v> ...`).
    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    /// Passthrough keys that were ignored because they shadow mandatory fields.
    pub fn dropped_keys(&self) -> &[String] {
        &self.dropped
    }

    /// Renders the properties file, one `key=value` per line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.properties {
            out.push_str(&escape(key, true));
            out.push('=');
            out.push_str(&escape(value, false));
            out.push('\n');
        }
        out
    }

    /// Writes the properties file into `dir` and returns its path.
    pub async fn write_to(&self, dir: &Path) -> std::io::Result<std::path::PathBuf> {
        let path = dir.join(ENGINE_CONFIG_FILE_NAME);
        tokio::fs::write(&path, self.render()).await?;
        Ok(path)
    }

    /// Appends the properties to the file in `dir`, keeping whatever an
    /// earlier `-detect` run wrote there.
    pub async fn append_to(&self, dir: &Path) -> std::io::Result<std::path::PathBuf> {
        let path = dir.join(ENGINE_CONFIG_FILE_NAME);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(b"\n").await?;
        file.write_all(self.render().as_bytes()).await?;
        file.flush().await?;
        Ok(path)
    }
}

/// Escapes a properties-file key or value.
fn escape(s: &str, is_key: bool) -> String {
    let mut out = String::with_capacity(s.len());
    for (i, c) in s.chars().enumerate() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '=' | ':' | '#' | '!' if is_key => {
                out.push('\\');
                out.push(c);
            }
            ' ' if is_key || i == 0 => out.push_str("\\ "),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scan_config(extras: serde_json::Value) -> ScanConfig {
        let mut v = json!({
            "apiKey": "org-token",
            "productToken": "prod-token",
            "projectName": "my-component",
            "requesterEmail": "dev@example.com",
            "userKey": "user-key",
            "wssUrl": "https://saas.example.com/agent",
        });
        v["extraWsConfig"] = extras;
        ScanConfig::from_object(v.as_object().unwrap()).unwrap()
    }

    #[test]
    fn maps_mandatory_fields_to_engine_names() {
        let cfg = EngineConfig::from_scan_config(&scan_config(json!({"foo": "bar"})));
        assert_eq!(cfg.get("apiKey"), Some("org-token"));
        assert_eq!(cfg.get("userKey"), Some("user-key"));
        assert_eq!(cfg.get("wss.url"), Some("https://saas.example.com/agent"));
        assert_eq!(cfg.get("productToken"), Some("prod-token"));
        assert_eq!(cfg.get("projectName"), Some("my-component"));
        assert_eq!(cfg.get("requesterEmail"), Some("dev@example.com"));
        assert_eq!(cfg.get("foo"), Some("bar"));
        assert_eq!(cfg.get("failErrorLevel"), Some("ALL"));
        assert!(cfg.dropped_keys().is_empty());
    }

    #[test]
    fn command_line_carries_credentials() {
        let cfg = EngineConfig::from_scan_config(&scan_config(json!({})));
        let args = cfg.arguments().join(" ");
        assert_eq!(
            args,
            "-apiKey org-token -userKey user-key -wss.url https://saas.example.com/agent \
             -productToken prod-token -project my-component"
        );
    }

    #[test]
    fn extras_never_shadow_mandatory_fields() {
        let cfg = EngineConfig::from_scan_config(&scan_config(json!({
            "apiKey": "evil",
            "wss.url": "https://elsewhere",
            "wssUrl": "https://elsewhere",
            "project": "other",
            "includes": "**/*.jar",
        })));
        assert_eq!(cfg.get("apiKey"), Some("org-token"));
        assert_eq!(cfg.get("wss.url"), Some("https://saas.example.com/agent"));
        assert_eq!(cfg.get("wssUrl"), None);
        assert_eq!(cfg.get("project"), None);
        assert_eq!(cfg.get("includes"), Some("**/*.jar"));
        assert_eq!(
            cfg.dropped_keys(),
            ["apiKey", "project", "wss.url", "wssUrl"]
        );
    }

    #[test]
    fn extras_may_override_fixed_settings() {
        let cfg = EngineConfig::from_scan_config(&scan_config(json!({
            "failErrorLevel": "NONE",
            "archiveExtractionDepth": 4,
            "python.resolveDependencies": false,
        })));
        assert_eq!(cfg.get("failErrorLevel"), Some("NONE"));
        assert_eq!(cfg.get("archiveExtractionDepth"), Some("4"));
        assert_eq!(cfg.get("python.resolveDependencies"), Some("false"));
    }

    #[test]
    fn render_escapes_special_characters() {
        let cfg = EngineConfig::from_scan_config(&scan_config(json!({
            "odd key": "line1\nline2",
            "path": "C:\\scan",
        })));
        let text = cfg.render();
        assert!(text.contains("odd\\ key=line1\\nline2\n"));
        assert!(text.contains("path=C:\\\\scan\n"));
        assert!(text.contains("wss.url=https://saas.example.com/agent\n"));
    }

    #[tokio::test]
    async fn writes_properties_file() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = EngineConfig::from_scan_config(&scan_config(json!({"foo": "bar"})));
        let path = cfg.write_to(tmp.path()).await.unwrap();
        assert!(path.ends_with(ENGINE_CONFIG_FILE_NAME));
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.lines().any(|l| l == "foo=bar"));
        assert!(text.lines().any(|l| l == "requesterEmail=dev@example.com"));
    }

    #[tokio::test]
    async fn appends_after_detected_properties() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(ENGINE_CONFIG_FILE_NAME), "npm.resolveDependencies=true").unwrap();
        let cfg = EngineConfig::from_scan_config(&scan_config(json!({"foo": "bar"})));
        let path = cfg.append_to(tmp.path()).await.unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.starts_with("npm.resolveDependencies=true\n"));
        assert!(text.lines().any(|l| l == "foo=bar"));
        assert!(text.lines().any(|l| l == "failErrorLevel=ALL"));
    }
}
