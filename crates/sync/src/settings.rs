use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::chat::DEFAULT_GREETING;
use crate::toast::{DEFAULT_TOAST_DURATION, Severity};

pub const SETTINGS_DIRECTORY_NAME: &str = "notebook";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const UNTITLED_NOTEBOOK_TITLE: &str = "Untitled Notebook";

const DEFAULT_TOAST_MILLIS: u64 = DEFAULT_TOAST_DURATION.as_millis() as u64;

/// Tunables for the reconciliation layer, read from `settings.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub toast_duration_ms: u64,
    pub error_toast_duration_ms: u64,
    pub default_greeting: String,
    pub confirm_deletes: bool,
    pub untitled_notebook_title: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            toast_duration_ms: DEFAULT_TOAST_MILLIS,
            error_toast_duration_ms: DEFAULT_TOAST_MILLIS,
            default_greeting: DEFAULT_GREETING.to_string(),
            confirm_deletes: true,
            untitled_notebook_title: UNTITLED_NOTEBOOK_TITLE.to_string(),
        }
    }
}

impl SyncSettings {
    pub fn normalized(mut self) -> Self {
        if self.toast_duration_ms == 0 {
            self.toast_duration_ms = DEFAULT_TOAST_MILLIS;
        }
        if self.error_toast_duration_ms == 0 {
            self.error_toast_duration_ms = DEFAULT_TOAST_MILLIS;
        }
        self.default_greeting = non_blank_or(self.default_greeting, DEFAULT_GREETING);
        self.untitled_notebook_title =
            non_blank_or(self.untitled_notebook_title, UNTITLED_NOTEBOOK_TITLE);
        self
    }

    pub fn toast_duration(&self) -> Duration {
        Duration::from_millis(self.toast_duration_ms)
    }

    /// Error toasts may linger longer than the rest.
    pub fn duration_for(&self, severity: Severity) -> Duration {
        match severity {
            Severity::Error => Duration::from_millis(self.error_toast_duration_ms),
            Severity::Success | Severity::Info | Severity::Warning => self.toast_duration(),
        }
    }

    /// Title used for a new notebook when the requested one is blank.
    pub fn resolve_title(&self, requested: &str) -> String {
        let requested = requested.trim();
        if requested.is_empty() {
            self.untitled_notebook_title.clone()
        } else {
            requested.to_string()
        }
    }
}

fn non_blank_or(value: String, fallback: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<SyncSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".notebook"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::read_settings(&config_path);
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

    pub fn settings(&self) -> Arc<SyncSettings> {
        self.settings.load_full()
    }

    /// Re-reads the file, e.g. after an external edit.
    pub fn reload(&self) -> Arc<SyncSettings> {
        let settings = Arc::new(Self::read_settings(&self.config_path));
        self.settings.store(Arc::clone(&settings));
        settings
    }

    pub fn update(&self, settings: SyncSettings) -> Result<(), ConfigError> {
        let settings = settings.normalized();
        self.persist(&settings)?;
        self.settings.store(Arc::new(settings));
        Ok(())
    }

    fn read_settings(path: &Path) -> SyncSettings {
        if !path.exists() {
            tracing::info!(path = %path.display(), "settings file not found, using defaults");
            return SyncSettings::default();
        }

        let figment =
            Figment::from(Serialized::defaults(SyncSettings::default())).merge(Json::file(path));

        match figment.extract::<SyncSettings>() {
            Ok(settings) => {
                tracing::info!(path = %path.display(), "loaded settings");
                settings.normalized()
            }
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %error,
                    "failed to parse settings, using defaults"
                );
                SyncSettings::default()
            }
        }
    }

    fn persist(&self, settings: &SyncSettings) -> Result<(), ConfigError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeSnafu {
            stage: "serialize-settings",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(ReplaceFileSnafu {
            stage: "replace-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!(path = %self.config_path.display(), "saved settings");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    Serialize {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to move settings from {from:?} to {to:?} on `{stage}`: {source}"))]
    ReplaceFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}
