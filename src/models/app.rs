use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A detected Chromium-embedding application.
///
/// Identity is the install path: two records with the same `path` describe the
/// same application, whatever their other fields say.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppRecord {
    pub name: String,
    pub path: Utf8PathBuf,
    pub version: String,

    /// Bytes taken by the kernel files found directly in `path`.
    #[serde(default)]
    pub size: u64,

    pub last_scan: DateTime<Utc>,
}

impl AppRecord {
    /// Build a record stamped with the current time.
    ///
    /// The name is the final path segment, or the whole path for a volume root.
    pub fn new(path: impl Into<Utf8PathBuf>, version: impl Into<String>, size: u64) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(str::to_string)
            .unwrap_or_else(|| path.to_string());

        Self {
            name,
            path,
            version: version.into(),
            size,
            last_scan: Utc::now(),
        }
    }

    pub fn is_at(&self, path: &Utf8Path) -> bool {
        self.path == path
    }
}

/// Redirection status of an application, derived from its directory contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectionState {
    /// No backup directory: the app runs on its own kernel files.
    Unredirected,

    /// Backup present and the kernel files are linked into the shared copy.
    Redirected,

    /// Backup present but the app directory does not match it; must be
    /// restored before the app can be redirected again.
    PartiallyRedirected,
}

impl fmt::Display for RedirectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RedirectionState::Unredirected => "not redirected",
            RedirectionState::Redirected => "redirected",
            RedirectionState::PartiallyRedirected => "partially redirected",
        };
        f.write_str(label)
    }
}
