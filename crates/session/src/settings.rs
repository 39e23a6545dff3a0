use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use parley_api::{BackendConfig, CredentialProvider, StaticCredentials};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000/api";
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 64;
pub const SETTINGS_DIRECTORY_NAME: &str = "parley";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
/// `PARLEY_IDLE_TIMEOUT_MS`, `PARLEY_BACKEND__BASE_URL`, ...
pub const ENV_PREFIX: &str = "PARLEY_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: String::new(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl BackendSettings {
    pub fn to_backend_config(&self) -> BackendConfig {
        BackendConfig::new(&self.base_url)
            .with_request_timeout(Duration::from_millis(self.request_timeout_ms))
    }

    pub fn credentials(&self) -> Arc<dyn CredentialProvider> {
        if self.api_key.trim().is_empty() {
            return StaticCredentials::anonymous();
        }
        Arc::new(StaticCredentials::new(&self.api_key))
    }

    fn normalized(mut self) -> Self {
        self.base_url = if self.base_url.trim().is_empty() {
            default_base_url()
        } else {
            self.base_url.trim().to_string()
        };
        self.api_key = self.api_key.trim().to_string();
        if self.request_timeout_ms == 0 {
            self.request_timeout_ms = default_request_timeout_ms();
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default)]
    pub backend: BackendSettings,
    /// Longest silence tolerated from an unpaused exchange before it is failed.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Approve validations automatically when the agent already holds a standing permission
    /// for the tool.
    #[serde(default = "default_true")]
    pub auto_approve_standing: bool,
    #[serde(default = "default_true")]
    pub refresh_after_cancel: bool,
    #[serde(default = "default_notification_capacity")]
    pub notification_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            backend: BackendSettings::default(),
            idle_timeout_ms: default_idle_timeout_ms(),
            auto_approve_standing: true,
            refresh_after_cancel: true,
            notification_capacity: default_notification_capacity(),
        }
    }
}

impl SessionSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout_ms = u64::try_from(idle_timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn normalized(mut self) -> Self {
        self.backend = self.backend.normalized();
        if self.idle_timeout_ms == 0 {
            self.idle_timeout_ms = default_idle_timeout_ms();
        }
        // broadcast channels panic on zero capacity.
        self.notification_capacity = self.notification_capacity.max(1);
        self
    }
}

/// Settings shared between the controller and whoever edits them.
pub struct SettingsStore {
    settings: Arc<ArcSwap<SessionSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".parley"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<SessionSettings> {
        self.settings.load_full()
    }

    /// Handle read by controllers built with `SessionController::with_settings_store`.
    pub(crate) fn shared(&self) -> Arc<ArcSwap<SessionSettings>> {
        Arc::clone(&self.settings)
    }

    pub fn update(&self, settings: SessionSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn figment(path: &Path) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(SessionSettings::default()));
        if path.exists() {
            figment = figment.merge(Json::file(path));
        } else {
            tracing::info!("settings file not found at {:?}, using defaults", path);
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    fn load_from_disk(path: &Path) -> SessionSettings {
        match Self::figment(path).extract::<SessionSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                SessionSettings::default()
            }
        }
    }

    /// Stages the document next to the target and swaps it in. Identical content is left alone.
    fn persist(&self, settings: &SessionSettings) -> Result<(), SettingsError> {
        let mut document = serde_json::to_vec_pretty(settings).context(EncodeSnafu {
            stage: "encode-settings",
        })?;
        document.push(b'\n');

        if std::fs::read(&self.config_path).is_ok_and(|current| current == document) {
            tracing::debug!("settings at {:?} unchanged", self.config_path);
            return Ok(());
        }

        if let Some(directory) = self
            .config_path
            .parent()
            .filter(|directory| !directory.as_os_str().is_empty())
        {
            std::fs::create_dir_all(directory).context(PrepareDirectorySnafu {
                stage: "prepare-settings-directory",
                path: directory.to_path_buf(),
            })?;
        }

        let staged = staging_path(&self.config_path);
        std::fs::write(&staged, &document).context(StageSnafu {
            stage: "stage-settings",
            path: staged.clone(),
        })?;
        if let Err(source) = std::fs::rename(&staged, &self.config_path) {
            if let Err(cleanup) = std::fs::remove_file(&staged) {
                tracing::debug!("left staged settings at {:?}: {}", staged, cleanup);
            }
            return Err(source).context(CommitSnafu {
                stage: "commit-settings",
                path: self.config_path.clone(),
            });
        }

        tracing::info!("settings written to {:?}", self.config_path);
        Ok(())
    }
}

/// `settings.json` is staged as `.settings.json.partial` in the same directory.
fn staging_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| SETTINGS_FILE_NAME.to_string());
    target.with_file_name(format!(".{name}.partial"))
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("cannot prepare {path:?} for settings on `{stage}`: {source}"))]
    PrepareDirectory {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("cannot encode settings on `{stage}`: {source}"))]
    Encode {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("cannot stage settings at {path:?} on `{stage}`: {source}"))]
    Stage {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("cannot move staged settings over {path:?} on `{stage}`: {source}"))]
    Commit {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

fn default_idle_timeout_ms() -> u64 {
    DEFAULT_IDLE_TIMEOUT_MS
}

fn default_notification_capacity() -> usize {
    DEFAULT_NOTIFICATION_CAPACITY
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SettingsStore::new(dir.path().join("settings.json"));

        assert_eq!(store.settings().idle_timeout_ms, DEFAULT_IDLE_TIMEOUT_MS);
        assert!(store.settings().auto_approve_standing);
    }

    #[test]
    fn partial_file_is_merged_over_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{ "idle_timeout_ms": 1500, "backend": { "base_url": " https://agents.test/api " } }"#,
        )
        .expect("write settings");

        let settings = SettingsStore::new(path).settings();

        assert_eq!(settings.idle_timeout(), Duration::from_millis(1500));
        assert_eq!(settings.backend.base_url, "https://agents.test/api");
        assert_eq!(settings.backend.request_timeout_ms, DEFAULT_REQUEST_TIMEOUT_MS);
        assert!(settings.refresh_after_cancel);
    }

    #[test]
    fn malformed_file_uses_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").expect("write settings");

        assert_eq!(*SettingsStore::new(path).settings(), SessionSettings::default());
    }

    #[test]
    fn update_persists_normalized_settings() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("settings.json");
        let store = SettingsStore::new(path.clone());

        let mut settings = SessionSettings::default();
        settings.notification_capacity = 0;
        settings.backend.api_key = "  secret  ".to_string();
        store.update(settings).expect("update settings");

        assert_eq!(store.settings().notification_capacity, 1);
        let reloaded = SettingsStore::new(path).settings();
        assert_eq!(reloaded.backend.api_key, "secret");
        assert_eq!(reloaded.notification_capacity, 1);
    }

    #[test]
    fn update_leaves_no_staged_file_behind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        let store = SettingsStore::new(path.clone());

        let settings = SessionSettings::default().with_idle_timeout(Duration::from_secs(5));
        store.update(settings.clone()).expect("first update");
        store.update(settings).expect("unchanged update");

        assert!(!staging_path(&path).exists());
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read dir")
            .map(|entry| entry.expect("entry").file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("settings.json")]);
        assert_eq!(SettingsStore::new(path).settings().idle_timeout_ms, 5_000);
    }

    #[test]
    fn staged_file_sits_beside_target() {
        assert_eq!(
            staging_path(Path::new("/etc/parley/settings.json")),
            PathBuf::from("/etc/parley/.settings.json.partial")
        );
    }

    #[test]
    fn backend_config_carries_request_timeout() {
        let mut settings = BackendSettings::default();
        settings.request_timeout_ms = 2_000;

        let config = settings.to_backend_config();

        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.request_timeout, Duration::from_secs(2));
    }
}
