use crate::error::UpdaterError;
use crate::types::UpdateInterval;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

pub const DEFAULT_CONFIG_FILE: &str = "appsettings.json";
pub const DEFAULT_LISTING_URL: &str =
    "https://api.github.com/repos/lovelyyoshino/Halcon_licenses/contents/";
pub const HALCON_ROOT_VAR: &str = "HALCONROOT";

pub type SharedSettings = Arc<RwLock<Settings>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Settings {
    /// Listing base URL; the dated folder key is appended verbatim.
    pub halcon_download_url: String,
    /// Relay prefixes in priority order. An empty entry means direct.
    #[serde(rename = "Proxys")]
    pub relays: Vec<String>,
    pub halcon_path: String,
    pub download_path: String,
    pub auto_update_enabled: bool,
    pub use_proxy: bool,
    pub update_interval_index: usize,
}

impl Default for Settings {
    fn default() -> Self {
        let download_path = dirs::document_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("HalconLicenses");
        Self {
            halcon_download_url: DEFAULT_LISTING_URL.to_string(),
            relays: Vec::new(),
            halcon_path: String::new(),
            download_path: download_path.to_string_lossy().into_owned(),
            auto_update_enabled: false,
            use_proxy: true,
            update_interval_index: UpdateInterval::Daily.index(),
        }
    }
}

impl Settings {
    pub fn install_root(&self) -> Option<PathBuf> {
        non_blank(&self.halcon_path).map(PathBuf::from)
    }

    pub fn download_root(&self) -> Option<PathBuf> {
        non_blank(&self.download_path).map(PathBuf::from)
    }

    /// Out-of-range indices fall back to daily.
    pub fn interval(&self) -> UpdateInterval {
        UpdateInterval::from_index(self.update_interval_index).unwrap_or(UpdateInterval::Daily)
    }
}

fn non_blank(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

/// Owns the settings file and its parsed contents.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    settings: Settings,
}

impl ConfigStore {
    /// Loads `path`, falling back to defaults when the file does not exist.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, UpdaterError> {
        let path = path.into();
        let settings = read_settings(&path)?;
        Ok(Self { path, settings })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    /// Writes the known settings back, keeping any other keys already in the file.
    pub fn save(&self) -> Result<(), UpdaterError> {
        let mut document = self.read_document()?;
        let Value::Object(known) = serde_json::to_value(&self.settings)? else {
            return Err(UpdaterError::Config("settings did not serialize to an object".into()));
        };
        match document.as_object_mut() {
            Some(object) => object.extend(known),
            None => document = Value::Object(known),
        }
        self.write_document(&document)?;
        info!("Configuration saved to {}", self.path.display());
        Ok(())
    }

    pub fn reload(&mut self) -> Result<(), UpdaterError> {
        self.settings = read_settings(&self.path)?;
        debug!("Configuration reloaded from {}", self.path.display());
        Ok(())
    }

    /// Sets one value addressed by a colon-separated key path, e.g.
    /// `"UseProxy"` or `"Section:Key"`, and reloads.
    ///
    /// Missing intermediate objects are created. Keys the settings struct
    /// does not know survive in the file untouched.
    pub fn update(&mut self, key_path: &str, value: Value) -> Result<(), UpdaterError> {
        let segments: Vec<&str> = key_path.split(':').filter(|s| !s.is_empty()).collect();
        let Some((last, parents)) = segments.split_last() else {
            return Err(UpdaterError::Config(format!("empty key path {:?}", key_path)));
        };

        let mut document = self.read_document()?;

        let mut node = &mut document;
        for segment in parents {
            let object = node.as_object_mut().ok_or_else(|| {
                UpdaterError::Config(format!("{} is not an object", segment))
            })?;
            node = object
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        node.as_object_mut()
            .ok_or_else(|| UpdaterError::Config(format!("parent of {} is not an object", last)))?
            .insert(last.to_string(), value);

        // Reject edits that would leave an unreadable file behind.
        serde_json::from_value::<Settings>(document.clone())
            .map_err(|e| UpdaterError::Config(format!("invalid value for {}: {}", key_path, e)))?;

        self.write_document(&document)?;
        info!("Updated {} in {}", key_path, self.path.display());
        self.reload()
    }

    fn read_document(&self) -> Result<Value, UpdaterError> {
        if self.path.exists() {
            Ok(serde_json::from_str(&std::fs::read_to_string(&self.path)?)?)
        } else {
            Ok(serde_json::to_value(&self.settings)?)
        }
    }

    fn write_document(&self, document: &Value) -> Result<(), UpdaterError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(document)?)?;
        Ok(())
    }

    /// Adopts `$HALCONROOT` as the install root when none is configured.
    pub fn detect_halcon_root(&mut self) -> bool {
        self.detect_halcon_root_from(std::env::var(HALCON_ROOT_VAR).ok())
    }

    fn detect_halcon_root_from(&mut self, value: Option<String>) -> bool {
        if self.settings.install_root().is_some() {
            return false;
        }
        match value.as_deref().and_then(non_blank) {
            Some(root) if Path::new(root).is_dir() => {
                info!("Using {}={} as Halcon install root", HALCON_ROOT_VAR, root);
                self.settings.halcon_path = root.to_string();
                true
            }
            Some(root) => {
                warn!("{} points to a missing directory: {}", HALCON_ROOT_VAR, root);
                false
            }
            None => false,
        }
    }

    pub fn shared(&self) -> SharedSettings {
        Arc::new(RwLock::new(self.settings.clone()))
    }
}

fn read_settings(path: &Path) -> Result<Settings, UpdaterError> {
    if !path.exists() {
        info!("No configuration at {}, using defaults", path.display());
        return Ok(Settings::default());
    }
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}
