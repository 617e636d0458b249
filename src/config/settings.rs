use super::ConfigManager;
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

/// Directory name of the shared kernel under the data directory.
pub const SHARED_KERNEL_DIR_NAME: &str = "SharedChrome";

const SETTINGS_FILE: &str = "settings.yaml";
const ENV_PREFIX: &str = "CHROMIUMTO";

/// Runtime settings.
///
/// Layered with the `config` crate: built-in defaults, then the optional
/// `<data_dir>/settings.yaml`, then `CHROMIUMTO_*` environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Settings {
    pub data_dir: Utf8PathBuf,
    pub log_dir: Utf8PathBuf,
    pub debug_mode: bool,
    pub console_log: bool,
}

impl Settings {
    /// Load settings rooted at the default data directory.
    pub fn load() -> Result<Self> {
        Self::load_from(default_data_dir()?)
    }

    /// Load settings rooted at `data_dir`.
    pub fn load_from(data_dir: impl Into<Utf8PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        let settings_file = data_dir.join(SETTINGS_FILE);

        let settings = config::Config::builder()
            .set_default("data_dir", data_dir.as_str())?
            .set_default("log_dir", data_dir.join("logs").as_str())?
            .set_default("debug_mode", false)?
            .set_default("console_log", false)?
            .add_source(
                config::File::new(settings_file.as_str(), config::FileFormat::Yaml)
                    .required(false),
            )
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .with_context(|| format!("Failed to load settings from {}", settings_file))?;

        settings
            .try_deserialize()
            .with_context(|| format!("Invalid settings in {}", settings_file))
    }

    /// Default location of the shared kernel.
    pub fn shared_kernel_dir(&self) -> Utf8PathBuf {
        self.data_dir.join(SHARED_KERNEL_DIR_NAME)
    }

    /// Open the app document store in the data directory.
    pub fn config_manager(&self) -> Result<ConfigManager> {
        ConfigManager::new(&self.data_dir)
    }

    pub fn data_dir(&self) -> &Utf8Path {
        &self.data_dir
    }
}

/// `<platform data dir>/ChromiumTo`.
pub fn default_data_dir() -> Result<Utf8PathBuf> {
    let base = dirs::data_dir().context("No data directory on this platform")?;
    let base = Utf8PathBuf::from_path_buf(base)
        .map_err(|p| anyhow::anyhow!("Data directory is not UTF-8: {}", p.display()))?;
    Ok(base.join("ChromiumTo"))
}
