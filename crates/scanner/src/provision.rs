//! Keeps a local copy of the Unified Agent jar.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::ProvisionError;

/// File name of the engine jar inside a session directory.
pub const AGENT_JAR_NAME: &str = "wss-unified-agent.jar";

/// Latest released engine.
pub const DEFAULT_AGENT_URL: &str = "https://github.com/whitesource/unified-agent-distribution/releases/latest/download/wss-unified-agent.jar";

/// Jars older than this are refreshed in the background.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct ProvisionSettings {
    /// Where the shared jar lives.
    pub jar_path: PathBuf,
    /// Download URL. Empty disables downloading.
    pub url: String,
    pub max_age: Duration,
}

impl Default for ProvisionSettings {
    fn default() -> Self {
        Self {
            jar_path: std::env::temp_dir().join(AGENT_JAR_NAME),
            url: DEFAULT_AGENT_URL.to_string(),
            max_age: DEFAULT_MAX_AGE,
        }
    }
}

/// Downloads the engine jar on first use and refreshes it once it is older
/// than [`ProvisionSettings::max_age`].
///
/// Sessions never run the shared jar directly: [`link_into`](Self::link_into)
/// hard-links it into the session directory so a concurrent refresh cannot
/// swap it out mid-scan.
pub struct AgentProvisioner {
    settings: ProvisionSettings,
    client: reqwest::Client,
    download_lock: Mutex<()>,
    refreshing: AtomicBool,
}

impl AgentProvisioner {
    pub fn new(settings: ProvisionSettings) -> Self {
        Self {
            settings,
            client: reqwest::Client::new(),
            download_lock: Mutex::new(()),
            refreshing: AtomicBool::new(false),
        }
    }

    /// Makes sure a jar is present and returns its path.
    ///
    /// A missing jar is downloaded before returning. A stale one is used
    /// as-is while a refresh runs in the background.
    pub async fn ensure(self: &Arc<Self>) -> Result<PathBuf, ProvisionError> {
        let jar = &self.settings.jar_path;
        match tokio::fs::metadata(jar).await {
            Ok(meta) => {
                let modified = meta.modified()?;
                if is_stale(modified, SystemTime::now(), self.settings.max_age) {
                    if self.settings.url.is_empty() {
                        tracing::debug!(path = %jar.display(), "engine jar is stale, downloads disabled");
                    } else {
                        tracing::info!(path = %jar.display(), "engine jar is stale, refreshing");
                        self.spawn_refresh();
                    }
                } else {
                    tracing::debug!(path = %jar.display(), "engine jar up to date");
                }
                Ok(jar.clone())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if self.settings.url.is_empty() {
                    return Err(ProvisionError::NotAvailable(jar.display().to_string()));
                }
                tracing::info!(path = %jar.display(), "engine jar not found, downloading");
                self.download_if_missing().await?;
                Ok(jar.clone())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Places the engine jar into `dir` and returns the new path.
    pub async fn link_into(self: &Arc<Self>, dir: &Path) -> Result<PathBuf, ProvisionError> {
        let jar = self.ensure().await?;
        let dest = dir.join(AGENT_JAR_NAME);
        if let Err(e) = tokio::fs::hard_link(&jar, &dest).await {
            tracing::debug!("hard link failed ({e}), copying engine jar");
            tokio::fs::copy(&jar, &dest).await?;
        }
        Ok(dest)
    }

    /// Downloads the jar unconditionally, replacing any existing copy.
    pub async fn download(&self) -> Result<u64, ProvisionError> {
        let _guard = self.download_lock.lock().await;
        self.download_locked().await
    }

    async fn download_if_missing(&self) -> Result<(), ProvisionError> {
        let _guard = self.download_lock.lock().await;
        // Another session may have finished the download while we waited.
        if tokio::fs::try_exists(&self.settings.jar_path).await? {
            return Ok(());
        }
        self.download_locked().await.map(|_| ())
    }

    fn spawn_refresh(self: &Arc<Self>) {
        if self.refreshing.swap(true, Ordering::AcqRel) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.download().await {
                tracing::error!("engine refresh failed, keeping the current jar: {e}");
            }
            this.refreshing.store(false, Ordering::Release);
        });
    }

    async fn download_locked(&self) -> Result<u64, ProvisionError> {
        let jar = &self.settings.jar_path;
        if let Some(parent) = jar.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut tmp = jar.clone().into_os_string();
        tmp.push(".download");
        let tmp = PathBuf::from(tmp);

        match self.fetch_to(&tmp).await {
            Ok(size) => {
                tokio::fs::rename(&tmp, jar).await?;
                tracing::info!(path = %jar.display(), size, "engine jar downloaded");
                Ok(size)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                Err(e)
            }
        }
    }

    async fn fetch_to(&self, path: &Path) -> Result<u64, ProvisionError> {
        let mut response = self
            .client
            .get(&self.settings.url)
            .send()
            .await?
            .error_for_status()?;

        let mut file = tokio::fs::File::create(path).await?;
        let mut size = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            size += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(size)
    }
}

/// True when a jar modified at `modified` is older than `max_age` at `now`.
pub fn is_stale(modified: SystemTime, now: SystemTime, max_age: Duration) -> bool {
    now.duration_since(modified)
        .map(|age| age > max_age)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn offline(jar_path: PathBuf) -> Arc<AgentProvisioner> {
        Arc::new(AgentProvisioner::new(ProvisionSettings {
            jar_path,
            url: String::new(),
            max_age: DEFAULT_MAX_AGE,
        }))
    }

    #[test]
    fn staleness() {
        let now = SystemTime::now();
        let day = Duration::from_secs(24 * 60 * 60);
        assert!(!is_stale(now, now, day));
        assert!(!is_stale(now - Duration::from_secs(60), now, day));
        assert!(is_stale(now - day - Duration::from_secs(1), now, day));
        // Clock skew: a jar from the future is not stale.
        assert!(!is_stale(now + Duration::from_secs(60), now, day));
    }

    #[tokio::test]
    async fn present_jar_is_used() {
        let tmp = TempDir::new().unwrap();
        let jar = tmp.path().join(AGENT_JAR_NAME);
        std::fs::write(&jar, b"jar-bytes").unwrap();

        let provisioner = offline(jar.clone());
        assert_eq!(provisioner.ensure().await.unwrap(), jar);
    }

    #[tokio::test]
    async fn missing_jar_without_url_is_unavailable() {
        let tmp = TempDir::new().unwrap();
        let provisioner = offline(tmp.path().join("missing.jar"));
        let err = provisioner.ensure().await.unwrap_err();
        assert!(matches!(err, ProvisionError::NotAvailable(_)));
    }

    #[tokio::test]
    async fn link_into_places_jar_in_session_dir() {
        let tmp = TempDir::new().unwrap();
        let jar = tmp.path().join("cache").join("agent.jar");
        std::fs::create_dir_all(jar.parent().unwrap()).unwrap();
        std::fs::write(&jar, b"jar-bytes").unwrap();
        let session = tmp.path().join("session");
        std::fs::create_dir_all(&session).unwrap();

        let provisioner = offline(jar.clone());
        let linked = provisioner.link_into(&session).await.unwrap();
        assert_eq!(linked, session.join(AGENT_JAR_NAME));
        assert_eq!(std::fs::read(&linked).unwrap(), b"jar-bytes");

        // Removing the session copy leaves the shared jar intact.
        std::fs::remove_dir_all(&session).unwrap();
        assert!(jar.exists());
    }
}
