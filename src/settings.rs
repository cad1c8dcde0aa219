use crate::errors::{MirrorError, MirrorErrorType, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub const DEFAULT_TRANSFER_BUFFER_SIZE: usize = 4 * 1024 * 1024;
pub const DEFAULT_WATCH_DEBOUNCE_MS: u64 = 2000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub served_directories: Vec<PathBuf>,
    pub flatten: bool,
    pub exclude_empty_directories: bool,
    pub allowed_extensions: Vec<String>,
    pub auto_detect_changes: bool,
    pub refresh_interval_secs: Option<u64>,
    pub forced_refresh_interval_secs: Option<u64>,
    pub watch_debounce_ms: u64,
    pub transfer_buffer_size: usize,
    pub listen_address: IpAddr,
    pub port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            served_directories: Vec::new(),
            flatten: false,
            exclude_empty_directories: true,
            allowed_extensions: ["nsp", "nsz", "xci", "xcz"]
                .iter()
                .map(|e| e.to_string())
                .collect(),
            auto_detect_changes: true,
            refresh_interval_secs: Some(3600),
            forced_refresh_interval_secs: None,
            watch_debounce_ms: DEFAULT_WATCH_DEBOUNCE_MS,
            transfer_buffer_size: DEFAULT_TRANSFER_BUFFER_SIZE,
            listen_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8080,
        }
    }
}

/// The part of the settings a snapshot depends on. Two settings values with the
/// same key produce the same tree from the same filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotKey {
    served_directories: Vec<PathBuf>,
    flatten: bool,
    exclude_empty_directories: bool,
    allowed_extensions: BTreeSet<String>,
}

/// The part of the settings the change watchers depend on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchKey {
    served_directories: Vec<PathBuf>,
    auto_detect_changes: bool,
    watch_debounce_ms: u64,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Settings> {
        let contents = std::fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&contents)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Like `load`, but a file that does not exist yet just means defaults.
    pub fn load_or_default(path: &Path) -> Result<Settings> {
        if !path.exists() {
            tracing::info!(
                "No settings file at {}, using defaults",
                path.display()
            );
            return Ok(Settings::default());
        }
        Settings::load(path)
    }

    pub fn validate(&self) -> Result<()> {
        if self.transfer_buffer_size == 0 {
            return Err(MirrorError::new(
                MirrorErrorType::InvalidSettings,
                "transfer_buffer_size must be greater than zero".to_string(),
            ));
        }
        if self.allowed_extensions.iter().all(|e| e.trim().is_empty()) {
            tracing::warn!("No file extensions are allowed, nothing will be served");
        }
        Ok(())
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        non_zero_secs(self.refresh_interval_secs)
    }

    pub fn forced_refresh_interval(&self) -> Option<Duration> {
        non_zero_secs(self.forced_refresh_interval_secs)
    }

    pub fn watch_debounce(&self) -> Duration {
        Duration::from_millis(self.watch_debounce_ms)
    }

    pub fn snapshot_key(&self) -> SnapshotKey {
        SnapshotKey {
            served_directories: self.served_directories.clone(),
            flatten: self.flatten,
            exclude_empty_directories: self.exclude_empty_directories,
            allowed_extensions: self
                .allowed_extensions
                .iter()
                .map(|e| e.trim().trim_start_matches('.').to_lowercase())
                .collect(),
        }
    }

    pub fn watch_key(&self) -> WatchKey {
        WatchKey {
            served_directories: self.served_directories.clone(),
            auto_detect_changes: self.auto_detect_changes,
            watch_debounce_ms: self.watch_debounce_ms,
        }
    }
}

fn non_zero_secs(secs: Option<u64>) -> Option<Duration> {
    secs.filter(|s| *s > 0).map(Duration::from_secs)
}

pub fn default_settings_path() -> Option<PathBuf> {
    let base_dirs = BaseDirs::new()?;
    Some(base_dirs.config_dir().join("mirrorfs").join("settings.json"))
}

/// Shared, change-notifying holder for the current settings.
#[derive(Clone)]
pub struct SettingsHandle {
    tx: Arc<watch::Sender<Settings>>,
}

impl SettingsHandle {
    pub fn new(settings: Settings) -> SettingsHandle {
        let (tx, _) = watch::channel(settings);
        SettingsHandle { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> Settings {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Settings> {
        self.tx.subscribe()
    }

    /// Replace the settings. Subscribers are only woken if something changed.
    pub fn update(&self, settings: Settings) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == settings {
                return false;
            }
            *current = settings;
            true
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("settings.json");
        std::fs::write(&path, r#"{"served_directories": ["/srv/games"], "flatten": true}"#)
            .unwrap();
        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.served_directories, vec![PathBuf::from("/srv/games")]);
        assert!(settings.flatten);
        assert_eq!(settings.transfer_buffer_size, DEFAULT_TRANSFER_BUFFER_SIZE);
        assert_eq!(settings.watch_debounce(), Duration::from_secs(2));
    }

    #[test]
    fn missing_file_gives_defaults_and_bad_file_errors() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("nope.json");
        assert_eq!(Settings::load_or_default(&missing).unwrap(), Settings::default());

        let bad = tmp.path().join("bad.json");
        std::fs::write(&bad, "{ not json").unwrap();
        let err = Settings::load_or_default(&bad).unwrap_err();
        assert_eq!(err.error_type, MirrorErrorType::InvalidSettings);

        let zero = tmp.path().join("zero.json");
        std::fs::write(&zero, r#"{"transfer_buffer_size": 0}"#).unwrap();
        assert!(Settings::load(&zero).is_err());
    }

    #[test]
    fn zero_intervals_disable_timers() {
        let settings = Settings {
            refresh_interval_secs: Some(0),
            forced_refresh_interval_secs: Some(30),
            ..Settings::default()
        };
        assert_eq!(settings.refresh_interval(), None);
        assert_eq!(settings.forced_refresh_interval(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn snapshot_key_ignores_unrelated_fields_and_extension_spelling() {
        let base = Settings::default();
        let other = Settings {
            port: 9999,
            refresh_interval_secs: None,
            allowed_extensions: vec![".NSP".into(), "nsz".into(), "XCI".into(), "xcz".into()],
            ..Settings::default()
        };
        assert_eq!(base.snapshot_key(), other.snapshot_key());

        let flattened = Settings {
            flatten: true,
            ..Settings::default()
        };
        assert_ne!(base.snapshot_key(), flattened.snapshot_key());
    }

    #[tokio::test]
    async fn handle_only_notifies_on_real_changes() {
        let handle = SettingsHandle::new(Settings::default());
        let mut rx = handle.subscribe();
        assert!(!handle.update(Settings::default()));
        assert!(!rx.has_changed().unwrap());

        let changed = Settings {
            flatten: true,
            ..Settings::default()
        };
        assert!(handle.update(changed.clone()));
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), changed);
        assert_eq!(handle.current(), changed);
    }
}
