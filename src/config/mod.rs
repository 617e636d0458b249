pub mod settings;

pub use settings::Settings;

use crate::models::{AppDocument, AppRecord, ExclusionSet};
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;
use std::sync::RwLock;

/// Persistence of the app document.
///
/// Implementations only load and save the whole [`AppDocument`]; the
/// provided methods are read-modify-write helpers on top of that.
#[cfg_attr(test, mockall::automock)]
pub trait AppRegistry {
    fn load(&self) -> Result<AppDocument>;

    fn save(&self, document: &AppDocument) -> Result<()>;

    /// Insert or refresh a detected app.
    fn add_detected_app(&self, app: &AppRecord) -> Result<()> {
        let mut document = self.load()?;
        document.upsert_detected(app.clone());
        self.save(&document)
    }

    fn clear_detected_apps(&self) -> Result<()> {
        let mut document = self.load()?;
        document.detected_apps.clear();
        self.save(&document)
    }

    /// Add an app to the redirected index. Returns false if it was already there.
    fn add_redirected_app(&self, app: &AppRecord) -> Result<bool> {
        let mut document = self.load()?;
        if !document.index_redirected(app) {
            return Ok(false);
        }
        self.save(&document)?;
        Ok(true)
    }

    /// Drop an app from the redirected index. Returns false if it was absent.
    fn remove_redirected_app(&self, path: &Utf8Path) -> Result<bool> {
        let mut document = self.load()?;
        if !document.unindex_redirected(path) {
            return Ok(false);
        }
        self.save(&document)?;
        Ok(true)
    }

    fn set_shared_kernel_path(&self, path: Option<Utf8PathBuf>) -> Result<()> {
        let mut document = self.load()?;
        document.shared_kernel_path = path;
        self.save(&document)
    }

    fn set_scan_exclusions(&self, exclusions: &ExclusionSet) -> Result<()> {
        let mut document = self.load()?;
        document.scan_exclusions = exclusions.clone().with_protected();
        self.save(&document)
    }
}

/// YAML-backed [`AppRegistry`].
///
/// The document lives at `<config_dir>/config.yaml`. A missing or empty file
/// loads as the default document; a malformed one is an error.
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_dir: Utf8PathBuf,
    document_path: Utf8PathBuf,
}

impl ConfigManager {
    /// Create a ConfigManager rooted at `config_dir`, creating the directory if needed.
    pub fn new<P: AsRef<Utf8Path>>(config_dir: P) -> Result<Self> {
        let config_dir = config_dir.as_ref().to_path_buf();

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)
                .with_context(|| format!("Failed to create config directory: {}", config_dir))?;
        }

        Ok(Self {
            document_path: config_dir.join("config.yaml"),
            config_dir,
        })
    }

    /// Get the configuration directory path.
    pub fn config_dir(&self) -> &Utf8Path {
        &self.config_dir
    }

    pub fn document_path(&self) -> &Utf8Path {
        &self.document_path
    }
}

impl AppRegistry for ConfigManager {
    fn load(&self) -> Result<AppDocument> {
        if !self.document_path.exists() {
            tracing::debug!(
                "Config file not found at {}, using defaults",
                self.document_path
            );
            return Ok(AppDocument::default());
        }

        let file_contents = fs::read_to_string(&self.document_path)
            .with_context(|| format!("Failed to read config: {}", self.document_path))?;

        if file_contents.trim().is_empty() {
            return Ok(AppDocument::default());
        }

        let mut document: AppDocument = serde_yaml_ng::from_str(&file_contents)
            .with_context(|| format!("Failed to parse config: {}", self.document_path))?;
        document.scan_exclusions.apply_protected();

        tracing::debug!("Loaded config from {}", self.document_path);
        Ok(document)
    }

    fn save(&self, document: &AppDocument) -> Result<()> {
        let yaml_string =
            serde_yaml_ng::to_string(document).context("Failed to serialize config to YAML")?;

        // Write beside the target, then rename over it
        let temp_path = self.document_path.with_extension("yaml.tmp");
        fs::write(&temp_path, yaml_string)
            .with_context(|| format!("Failed to write config: {}", temp_path))?;
        fs::rename(&temp_path, &self.document_path)
            .with_context(|| format!("Failed to replace config: {}", self.document_path))?;

        tracing::debug!("Saved config to {}", self.document_path);
        Ok(())
    }
}

/// In-memory [`AppRegistry`] for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    document: RwLock<AppDocument>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(mut document: AppDocument) -> Self {
        document.scan_exclusions.apply_protected();
        Self {
            document: RwLock::new(document),
        }
    }
}

impl AppRegistry for MemoryRegistry {
    fn load(&self) -> Result<AppDocument> {
        Ok(self.document.read().unwrap().clone())
    }

    fn save(&self, document: &AppDocument) -> Result<()> {
        *self.document.write().unwrap() = document.clone();
        Ok(())
    }
}
