use crate::models::AppRecord;
use camino::Utf8Path;
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

/// Exclusion patterns that are always part of the scan exclusions.
///
/// These are re-applied every time the document is loaded, so editing the
/// config file can never remove them.
pub const PROTECTED_EXCLUSIONS: [&str; 4] = [
    "Windows",
    "$Recycle.Bin",
    "System Volume Information",
    "AppData\\Local\\Temp",
];

/// Ordered set of substring patterns.
///
/// A path is excluded when any pattern occurs anywhere in it. Patterns are
/// plain substrings, not globs, and matching is case-sensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExclusionSet {
    patterns: IndexSet<String>,
}

impl ExclusionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The protected patterns only.
    pub fn protected() -> Self {
        Self::from_patterns(PROTECTED_EXCLUSIONS)
    }

    /// Build a set from patterns, dropping blank ones.
    pub fn from_patterns<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = Self::new();
        for pattern in patterns {
            set.insert(pattern);
        }
        set
    }

    /// Add a pattern. Blank patterns would exclude everything and are ignored.
    ///
    /// Returns true if the pattern was not already present.
    pub fn insert(&mut self, pattern: impl Into<String>) -> bool {
        let pattern = pattern.into();
        if pattern.trim().is_empty() {
            return false;
        }
        self.patterns.insert(pattern)
    }

    /// Remove a user pattern. Protected patterns stay.
    pub fn remove(&mut self, pattern: &str) -> bool {
        if Self::is_protected(pattern) {
            return false;
        }
        self.patterns.shift_remove(pattern)
    }

    /// Ensure every protected pattern is present, keeping user order first.
    pub fn with_protected(mut self) -> Self {
        self.apply_protected();
        self
    }

    pub fn apply_protected(&mut self) {
        for pattern in PROTECTED_EXCLUSIONS {
            self.patterns.insert(pattern.to_string());
        }
    }

    pub fn is_protected(pattern: &str) -> bool {
        PROTECTED_EXCLUSIONS.contains(&pattern)
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        self.patterns.iter().any(|p| path.contains(p.as_str()))
    }

    pub fn contains(&self, pattern: &str) -> bool {
        self.patterns.contains(pattern)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// The persisted document: shared kernel location, app lists and scan exclusions.
///
/// Loaded and saved as a whole by an [`AppRegistry`](crate::config::AppRegistry).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppDocument {
    #[serde(default)]
    pub shared_kernel_path: Option<camino::Utf8PathBuf>,

    #[serde(default)]
    pub detected_apps: Vec<AppRecord>,

    /// Cache of redirected apps. The backup directory on disk is authoritative.
    #[serde(default)]
    pub redirected_apps: Vec<AppRecord>,

    #[serde(default = "ExclusionSet::protected")]
    pub scan_exclusions: ExclusionSet,
}

impl Default for AppDocument {
    fn default() -> Self {
        Self {
            shared_kernel_path: None,
            detected_apps: Vec::new(),
            redirected_apps: Vec::new(),
            scan_exclusions: ExclusionSet::protected(),
        }
    }
}

impl AppDocument {
    /// Look an app up by install path, preferring the redirected index.
    pub fn find_app(&self, path: &Utf8Path) -> Option<&AppRecord> {
        self.redirected_apps
            .iter()
            .chain(self.detected_apps.iter())
            .find(|app| app.is_at(path))
    }

    pub fn is_indexed_redirected(&self, path: &Utf8Path) -> bool {
        self.redirected_apps.iter().any(|app| app.is_at(path))
    }

    /// Insert or refresh a detected app. A rescan only updates size, version
    /// and timestamp of an existing record.
    pub fn upsert_detected(&mut self, app: AppRecord) {
        match self.detected_apps.iter_mut().find(|a| a.is_at(&app.path)) {
            Some(existing) => {
                existing.size = app.size;
                existing.version = app.version;
                existing.last_scan = app.last_scan;
            }
            None => self.detected_apps.push(app),
        }
    }

    /// Add an app to the redirected index. Returns false if already indexed.
    pub fn index_redirected(&mut self, app: &AppRecord) -> bool {
        if self.is_indexed_redirected(&app.path) {
            return false;
        }
        self.redirected_apps.push(app.clone());
        true
    }

    /// Remove an app from the redirected index. Returns false if it was absent.
    pub fn unindex_redirected(&mut self, path: &Utf8Path) -> bool {
        let before = self.redirected_apps.len();
        self.redirected_apps.retain(|app| !app.is_at(path));
        self.redirected_apps.len() != before
    }
}
