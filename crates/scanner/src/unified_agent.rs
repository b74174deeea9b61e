//! [`ScanInvoker`] backed by the WhiteSource/Mend Unified Agent.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use wsscan_protocol::{ErrorKind, ScanConfig, ScanOutcome};

use crate::engine::EngineConfig;
use crate::extract::{COMPONENT_DIR_NAME, ExtractError, extract_component};
use crate::invoker::{InvokeFuture, ScanInvoker};
use crate::provision::AgentProvisioner;

/// How the engine process is launched.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Java executable.
    pub java_path: PathBuf,
    /// JVM options placed before `-jar`.
    pub jvm_args: Vec<String>,
    /// Run the agent's `-detect` mode first and append to what it generates.
    pub detect: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            java_path: PathBuf::from("java"),
            jvm_args: vec!["-Xms256m".into(), "-Xmx512m".into()],
            detect: false,
        }
    }
}

/// Runs `java -jar wss-unified-agent.jar` against a materialized archive.
///
/// The archive is unpacked into a `component` directory next to it, the
/// engine jar is linked into the archive's directory and the generated
/// properties file is written there as well, so everything one scan touches
/// lives in the session's scratch directory.
pub struct UnifiedAgentInvoker {
    settings: EngineSettings,
    provisioner: Arc<AgentProvisioner>,
}

impl UnifiedAgentInvoker {
    pub fn new(settings: EngineSettings, provisioner: Arc<AgentProvisioner>) -> Self {
        Self {
            settings,
            provisioner,
        }
    }

    async fn run(&self, config: &ScanConfig, archive: &Path) -> ScanOutcome {
        let workdir = archive.parent().unwrap_or_else(|| Path::new("."));

        let component = workdir.join(COMPONENT_DIR_NAME);
        match extract_component(archive, &component).await {
            Ok(extracted) => tracing::info!(
                entries = extracted.entries,
                layers = extracted.layers,
                skipped = extracted.skipped,
                "archive unpacked"
            ),
            Err(ExtractError::Corrupted(reason)) => {
                tracing::warn!("archive rejected: {reason}");
                return ScanOutcome::failure(
                    ErrorKind::BinaryCorrupted,
                    format!("archive is corrupted: {reason}"),
                    None,
                );
            }
            Err(ExtractError::Io(e)) => {
                tracing::error!("failed to unpack archive: {e}");
                return ScanOutcome::failure(
                    ErrorKind::Internal,
                    format!("failed to unpack archive: {e}"),
                    None,
                );
            }
        }

        let jar = match self.provisioner.link_into(workdir).await {
            Ok(path) => path,
            Err(e) => {
                tracing::error!("scan engine unavailable: {e}");
                return ScanOutcome::failure(
                    ErrorKind::ScanInvocation,
                    format!("scan engine unavailable: {e}"),
                    None,
                );
            }
        };

        let engine_config = EngineConfig::from_scan_config(config);
        if !engine_config.dropped_keys().is_empty() {
            tracing::warn!(
                keys = ?engine_config.dropped_keys(),
                "ignoring passthrough options that shadow mandatory fields"
            );
        }
        let written = if self.settings.detect {
            self.detect(&jar, workdir).await;
            engine_config.append_to(workdir).await
        } else {
            engine_config.write_to(workdir).await
        };
        let config_path = match written {
            Ok(path) => path,
            Err(e) => {
                return ScanOutcome::failure(
                    ErrorKind::ScanInvocation,
                    format!("failed to write engine configuration: {e}"),
                    None,
                );
            }
        };

        tracing::info!(java = %self.settings.java_path.display(), "agent start");
        let output = tokio::process::Command::new(&self.settings.java_path)
            .args(&self.settings.jvm_args)
            .arg("-jar")
            .arg(&jar)
            .arg("-c")
            .arg(&config_path)
            .arg("-d")
            .arg(&component)
            .args(engine_config.arguments())
            .current_dir(workdir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;

        let output = match output {
            Ok(o) => o,
            Err(e) => {
                tracing::error!("failed to start scan engine: {e}");
                return ScanOutcome::failure(
                    ErrorKind::ScanInvocation,
                    format!("failed to start scan engine: {e}"),
                    None,
                );
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let code = output.status.code();
        tracing::info!(exit_code = ?code, "agent done");

        if output.status.success() {
            ScanOutcome::success(stdout, code)
        } else {
            let mut detail = format!("{stderr}{stdout}");
            if code.is_none() {
                detail.push_str("scan engine terminated by signal");
            }
            ScanOutcome::failure(ErrorKind::ScanFailure, detail, code)
        }
    }

    /// Lets the agent generate its own configuration in `workdir`.
    async fn detect(&self, jar: &Path, workdir: &Path) {
        tracing::info!("generating engine configuration");
        let status = tokio::process::Command::new(&self.settings.java_path)
            .args(&self.settings.jvm_args)
            .arg("-jar")
            .arg(jar)
            .arg("-detect")
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await;
        match status {
            Ok(s) if s.success() => {}
            Ok(s) => tracing::warn!(exit_code = ?s.code(), "engine -detect failed"),
            Err(e) => tracing::warn!("failed to run engine -detect: {e}"),
        }
    }
}

impl ScanInvoker for UnifiedAgentInvoker {
    fn invoke<'a>(&'a self, config: &'a ScanConfig, archive: &'a Path) -> InvokeFuture<'a> {
        Box::pin(self.run(config, archive))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::engine::ENGINE_CONFIG_FILE_NAME;
    use crate::provision::ProvisionSettings;
    use serde_json::json;
    use tempfile::TempDir;
    use wsscan_protocol::ScanStatus;

    fn scan_config() -> ScanConfig {
        let v = json!({
            "apiKey": "org",
            "productToken": "prod",
            "projectName": "proj",
            "requesterEmail": "dev@example.com",
            "userKey": "user",
            "wssUrl": "https://wss.example.com/agent",
            "extraWsConfig": {"foo": "bar"},
        });
        ScanConfig::from_object(v.as_object().unwrap()).unwrap()
    }

    /// Invoker whose "java" is `sh -c <script>`; engine arguments land in
    /// the script's positional parameters.
    fn shell_invoker(tmp: &TempDir, script: &str) -> UnifiedAgentInvoker {
        let jar = tmp.path().join("engine").join("wss-unified-agent.jar");
        std::fs::create_dir_all(jar.parent().unwrap()).unwrap();
        std::fs::write(&jar, b"jar").unwrap();
        let provisioner = Arc::new(AgentProvisioner::new(ProvisionSettings {
            jar_path: jar,
            url: String::new(),
            ..ProvisionSettings::default()
        }));
        let settings = EngineSettings {
            java_path: PathBuf::from("/bin/sh"),
            jvm_args: vec!["-c".into(), script.into(), "engine".into()],
            detect: false,
        };
        UnifiedAgentInvoker::new(settings, provisioner)
    }

    fn write_session_archive(tmp: &TempDir, bytes: &[u8]) -> PathBuf {
        let dir = tmp.path().join("session");
        std::fs::create_dir_all(&dir).unwrap();
        let archive = dir.join("archive.tar");
        std::fs::write(&archive, bytes).unwrap();
        archive
    }

    /// A one-file tar archive in the session directory.
    fn session_archive(tmp: &TempDir) -> PathBuf {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(8);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "app/requirements.txt", &b"ABCDEFGH"[..])
            .unwrap();
        write_session_archive(tmp, &builder.into_inner().unwrap())
    }

    #[tokio::test]
    async fn zero_exit_is_success_with_stdout() {
        let tmp = TempDir::new().unwrap();
        let invoker = shell_invoker(&tmp, "echo scan ok");
        let archive = session_archive(&tmp);

        let outcome = invoker.invoke(&scan_config(), &archive).await;
        assert_eq!(outcome.status, ScanStatus::Success);
        assert_eq!(outcome.detail, "scan ok\n");
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.kind, None);

        let dir = archive.parent().unwrap();
        assert!(dir.join("wss-unified-agent.jar").exists());
        assert_eq!(
            std::fs::read(dir.join("component/app/requirements.txt")).unwrap(),
            b"ABCDEFGH"
        );
        let props = std::fs::read_to_string(dir.join(ENGINE_CONFIG_FILE_NAME)).unwrap();
        assert!(props.lines().any(|l| l == "foo=bar"));
    }

    #[tokio::test]
    async fn passes_engine_arguments() {
        let tmp = TempDir::new().unwrap();
        // $1.. are: -jar <jar> -c <config> -d <component> -apiKey org ...
        let invoker = shell_invoker(&tmp, r#"echo "$@""#);
        let archive = session_archive(&tmp);

        let outcome = invoker.invoke(&scan_config(), &archive).await;
        assert!(outcome.is_success());
        let component = archive.parent().unwrap().join(COMPONENT_DIR_NAME);
        assert!(outcome.detail.contains(&format!("-d {}", component.display())));
        assert!(outcome.detail.contains("-apiKey org -userKey user"));
        assert!(outcome.detail.contains("-project proj"));
    }

    #[tokio::test]
    async fn detect_output_is_kept_and_extended() {
        let tmp = TempDir::new().unwrap();
        let mut invoker = shell_invoker(
            &tmp,
            &format!(
                r#"if [ "$3" = "-detect" ]; then echo detected=yes > {ENGINE_CONFIG_FILE_NAME}; else echo "$@"; fi"#
            ),
        );
        invoker.settings.detect = true;
        let archive = session_archive(&tmp);

        let outcome = invoker.invoke(&scan_config(), &archive).await;
        assert!(outcome.is_success(), "{outcome:?}");
        assert!(!outcome.detail.contains("-detect"));

        let props =
            std::fs::read_to_string(archive.parent().unwrap().join(ENGINE_CONFIG_FILE_NAME)).unwrap();
        assert!(props.starts_with("detected=yes\n"));
        assert!(props.lines().any(|l| l == "foo=bar"));
    }

    #[tokio::test]
    async fn corrupted_archive_never_starts_the_engine() {
        let tmp = TempDir::new().unwrap();
        let marker = tmp.path().join("ran");
        let invoker = shell_invoker(&tmp, &format!("touch {}", marker.display()));
        let archive = write_session_archive(&tmp, b"ABCDEFGH");

        let outcome = invoker.invoke(&scan_config(), &archive).await;
        assert_eq!(outcome.status, ScanStatus::Failure);
        assert_eq!(outcome.kind, Some(ErrorKind::BinaryCorrupted));
        assert_eq!(outcome.exit_code, None);
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn non_zero_exit_is_scan_failure() {
        let tmp = TempDir::new().unwrap();
        let invoker = shell_invoker(&tmp, "echo findings; echo policy violated >&2; exit 9");
        let archive = session_archive(&tmp);

        let outcome = invoker.invoke(&scan_config(), &archive).await;
        assert_eq!(outcome.status, ScanStatus::Failure);
        assert_eq!(outcome.kind, Some(ErrorKind::ScanFailure));
        assert_eq!(outcome.exit_code, Some(9));
        assert_eq!(outcome.detail, "policy violated\nfindings\n");
    }

    #[tokio::test]
    async fn missing_executable_is_invocation_error() {
        let tmp = TempDir::new().unwrap();
        let mut invoker = shell_invoker(&tmp, "true");
        invoker.settings.java_path = tmp.path().join("no-such-java");
        let archive = session_archive(&tmp);

        let outcome = invoker.invoke(&scan_config(), &archive).await;
        assert_eq!(outcome.kind, Some(ErrorKind::ScanInvocation));
        assert!(outcome.detail.contains("failed to start scan engine"));
    }

    #[tokio::test]
    async fn missing_jar_is_invocation_error() {
        let tmp = TempDir::new().unwrap();
        let provisioner = Arc::new(AgentProvisioner::new(ProvisionSettings {
            jar_path: tmp.path().join("absent.jar"),
            url: String::new(),
            ..ProvisionSettings::default()
        }));
        let invoker = UnifiedAgentInvoker::new(EngineSettings::default(), provisioner);
        let archive = session_archive(&tmp);

        let outcome = invoker.invoke(&scan_config(), &archive).await;
        assert_eq!(outcome.kind, Some(ErrorKind::ScanInvocation));
        assert!(outcome.detail.contains("scan engine unavailable"));
    }
}
