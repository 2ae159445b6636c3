use razer_remap_common::{tracing, Profile};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::StoreError;

/// Configuration manager for the razer-remap daemon
pub struct ConfigManager {
    pub config_dir: PathBuf,
    pub config_path: PathBuf,
    pub profiles_dir: PathBuf,
    pub active_profile_path: PathBuf,
    pub config: DaemonConfig,
}

/// Daemon configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub daemon: DaemonSettings,
    pub devices: DeviceSettings,
    pub macro_engine: MacroEngineSettings,
    pub app_watcher: AppWatcherSettings,
}

/// Daemon-specific settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    pub log_level: String,
    pub virtual_device_name: String,
    /// Upper bound on how long the read loop blocks before checking the stop flag
    pub poll_timeout_ms: u16,
}

/// Device registry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    pub by_id_dir: PathBuf,
    pub by_path_dir: PathBuf,
}

/// Macro engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MacroEngineSettings {
    pub max_concurrent_macros: usize,
    pub key_press_gap_ms: u64,
    pub record_min_delay_ms: u64,
}

/// Application watcher settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppWatcherSettings {
    pub enabled: bool,
    pub poll_interval_ms: u64,
    pub debounce_polls: u32,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            virtual_device_name: "Razer Remap Virtual Device".to_string(),
            poll_timeout_ms: 100,
        }
    }
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            by_id_dir: PathBuf::from("/dev/input/by-id"),
            by_path_dir: PathBuf::from("/dev/input/by-path"),
        }
    }
}

impl Default for MacroEngineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_macros: 10,
            key_press_gap_ms: 5,
            record_min_delay_ms: 5,
        }
    }
}

impl Default for AppWatcherSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval_ms: 500,
            debounce_polls: 2,
        }
    }
}

impl DaemonConfig {
    /// Parse the tracing level, falling back to INFO for unknown names
    pub fn log_level(&self) -> tracing::Level {
        match self.daemon.log_level.to_ascii_lowercase().as_str() {
            "trace" => tracing::Level::TRACE,
            "debug" => tracing::Level::DEBUG,
            "warn" | "warning" => tracing::Level::WARN,
            "error" => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        }
    }
}

impl ConfigManager {
    /// Default configuration directory (`~/.config/razer-remap`)
    pub fn default_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/etc"))
            .join("razer-remap")
    }

    /// Create a configuration manager rooted at `config_dir`, creating directories as needed
    pub async fn new(config_dir: impl Into<PathBuf>) -> Result<Self, Box<dyn std::error::Error>> {
        let config_dir = config_dir.into();
        let manager = Self {
            config_path: config_dir.join("config.yaml"),
            profiles_dir: config_dir.join("profiles"),
            active_profile_path: config_dir.join("active_profile"),
            config_dir,
            config: DaemonConfig::default(),
        };

        tokio::fs::create_dir_all(&manager.profiles_dir).await?;

        Ok(manager)
    }

    /// Load configuration from disk, writing the defaults when the file is missing
    pub async fn load_config(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        info!("Loading configuration from {}", self.config_path.display());

        if self.config_path.exists() {
            let content = tokio::fs::read_to_string(&self.config_path).await?;
            self.config = serde_yaml::from_str(&content)?;
            debug!("Loaded configuration from disk");
        } else {
            warn!("Configuration file not found, using defaults");
            self.save_config().await?;
        }

        Ok(())
    }

    /// Save configuration to disk
    pub async fn save_config(&self) -> Result<(), Box<dyn std::error::Error>> {
        info!("Saving configuration to {}", self.config_path.display());

        let content = serde_yaml::to_string(&self.config)?;
        write_atomic(&self.config_path, content.as_bytes())?;

        debug!("Configuration saved");
        Ok(())
    }

    /// Get a reference to the configuration
    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Profile store backed by this manager's directories
    pub fn profile_store(&self) -> FileProfileStore {
        FileProfileStore::new(&self.profiles_dir, &self.active_profile_path)
    }
}

/// Source of profiles and of the active-profile pointer
pub trait ProfileStore: Send + Sync {
    fn list_profiles(&self) -> Result<Vec<String>, StoreError>;
    fn load_profile(&self, id: &str) -> Result<Profile, StoreError>;
    fn save_profile(&self, profile: &Profile) -> Result<(), StoreError>;
    fn delete_profile(&self, id: &str) -> Result<(), StoreError>;
    fn get_active_profile_id(&self) -> Result<Option<String>, StoreError>;
    fn set_active_profile(&self, id: &str) -> Result<(), StoreError>;

    /// Load the profile the active pointer refers to, if any
    fn load_active_profile(&self) -> Result<Option<Profile>, StoreError> {
        match self.get_active_profile_id()? {
            Some(id) => self.load_profile(&id).map(Some),
            None => Ok(None),
        }
    }
}

/// YAML-file profile store: `<profiles_dir>/<id>.yaml` plus a plain-text active pointer
pub struct FileProfileStore {
    profiles_dir: PathBuf,
    active_profile_path: PathBuf,
}

impl FileProfileStore {
    pub fn new(profiles_dir: impl Into<PathBuf>, active_profile_path: impl Into<PathBuf>) -> Self {
        Self {
            profiles_dir: profiles_dir.into(),
            active_profile_path: active_profile_path.into(),
        }
    }

    fn profile_path(&self, id: &str) -> PathBuf {
        self.profiles_dir.join(format!("{}.yaml", id))
    }
}

impl ProfileStore for FileProfileStore {
    fn list_profiles(&self) -> Result<Vec<String>, StoreError> {
        let entries = match fs::read_dir(&self.profiles_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut profiles = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) == Some("yaml") {
                if let Some(id) = path.file_stem().and_then(|s| s.to_str()) {
                    profiles.push(id.to_string());
                }
            }
        }

        profiles.sort();
        Ok(profiles)
    }

    fn load_profile(&self, id: &str) -> Result<Profile, StoreError> {
        let path = self.profile_path(id);
        let yaml = match fs::read_to_string(&path) {
            Ok(yaml) => yaml,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let profile = serde_yaml::from_str(&yaml)
            .map_err(|source| StoreError::Parse { path: path.clone(), source })?;
        debug!("Profile {} loaded from {}", id, path.display());
        Ok(profile)
    }

    fn save_profile(&self, profile: &Profile) -> Result<(), StoreError> {
        fs::create_dir_all(&self.profiles_dir)?;
        let path = self.profile_path(&profile.id);
        let yaml = serde_yaml::to_string(profile)?;
        write_atomic(&path, yaml.as_bytes())?;

        info!("Profile {} saved to {}", profile.id, path.display());
        Ok(())
    }

    fn delete_profile(&self, id: &str) -> Result<(), StoreError> {
        let path = self.profile_path(id);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        }

        if self.get_active_profile_id()?.as_deref() == Some(id) {
            fs::remove_file(&self.active_profile_path)?;
        }

        info!("Profile {} deleted", id);
        Ok(())
    }

    fn get_active_profile_id(&self) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(&self.active_profile_path) {
            Ok(content) => {
                let id = content.trim();
                Ok(if id.is_empty() { None } else { Some(id.to_string()) })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set_active_profile(&self, id: &str) -> Result<(), StoreError> {
        write_atomic(&self.active_profile_path, format!("{}\n", id).as_bytes())?;
        debug!("Active profile set to {}", id);
        Ok(())
    }
}

/// Write through a temp file in the same directory and rename over the target
fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
