//! Directory traversal that discovers Chromium applications.
//!
//! [`DirectoryWalker`] is a lazy, finite iterator of [`ScanEvent`]s. It walks
//! each root depth-first, skips excluded subtrees without counting them, and
//! stops descending at the first application root it finds in a subtree.
//! Unreadable directories are skipped; the walk never aborts as a whole.
//!
//! ```ignore
//! use chromiumto::cancel::CancellationToken;
//! use chromiumto::models::ExclusionSet;
//! use chromiumto::services::walker::{DirectoryWalker, ScanEvent};
//!
//! let walker = DirectoryWalker::new(
//!     vec!["C:\\Program Files".into()],
//!     ExclusionSet::protected(),
//!     CancellationToken::new(),
//! );
//! for event in walker {
//!     if let ScanEvent::AppFound(app) = event {
//!         println!("{} ({})", app.name, app.version);
//!     }
//! }
//! ```

use crate::cancel::CancellationToken;
use crate::models::{AppRecord, ExclusionSet};
use crate::services::classifier;
use crate::services::kernel::KernelManifest;
use camino::{Utf8Path, Utf8PathBuf};
use std::collections::VecDeque;
use std::fs;
use walkdir::WalkDir;

/// Event emitted while walking.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    /// A directory was visited.
    Progress {
        scanned: u64,
        total: u64,
        current_path: Utf8PathBuf,
    },

    /// A directory was recognised as an application root.
    AppFound(AppRecord),
}

/// Which roots to walk and how to exclude.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPolicy {
    /// Well-known install directories, no exclusions.
    Quick,

    /// Every local volume, configured exclusions plus the protected ones.
    Full,
}

impl ScanPolicy {
    pub fn roots(&self) -> Vec<Utf8PathBuf> {
        match self {
            ScanPolicy::Quick => quick_scan_roots(),
            ScanPolicy::Full => local_volumes(),
        }
    }

    pub fn exclusions(&self, configured: &ExclusionSet) -> ExclusionSet {
        match self {
            ScanPolicy::Quick => ExclusionSet::new(),
            ScanPolicy::Full => configured.clone().with_protected(),
        }
    }
}

/// Directories where applications are usually installed.
pub fn quick_scan_roots() -> Vec<Utf8PathBuf> {
    let mut roots: Vec<Utf8PathBuf> = Vec::new();

    #[cfg(windows)]
    {
        let well_known = [
            ("ProgramFiles", r"C:\Program Files"),
            ("ProgramFiles(x86)", r"C:\Program Files (x86)"),
            ("LOCALAPPDATA", r"C:\Users\Default\AppData\Local"),
            ("APPDATA", r"C:\Users\Default\AppData\Roaming"),
        ];
        for (var, fallback) in well_known {
            let value = std::env::var(var).unwrap_or_else(|_| fallback.to_string());
            roots.push(Utf8PathBuf::from(value));
        }
    }

    #[cfg(not(windows))]
    {
        for dir in [dirs::data_local_dir(), dirs::data_dir()].into_iter().flatten() {
            if let Ok(path) = Utf8PathBuf::from_path_buf(dir) {
                roots.push(path);
            }
        }
        roots.push(Utf8PathBuf::from("/opt"));
    }

    roots.dedup();
    roots
}

/// Every mounted local volume root.
pub fn local_volumes() -> Vec<Utf8PathBuf> {
    #[cfg(windows)]
    {
        (b'A'..=b'Z')
            .map(|letter| Utf8PathBuf::from(format!("{}:\\", letter as char)))
            .filter(|root| root.exists())
            .collect()
    }

    #[cfg(not(windows))]
    {
        vec![Utf8PathBuf::from("/")]
    }
}

/// Count files under `roots`, skipping excluded subtrees.
///
/// Used as the progress denominator. Stops early, returning the partial count,
/// when `cancel` fires.
pub fn count_files(
    roots: &[Utf8PathBuf],
    exclusions: &ExclusionSet,
    cancel: &CancellationToken,
) -> u64 {
    let mut total = 0;
    for root in roots.iter().filter(|root| root.is_dir()) {
        let entries = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| {
                !entry.file_type().is_dir() || !is_excluded(entry.path(), exclusions)
            });

        for entry in entries {
            if cancel.is_cancelled() {
                return total;
            }
            if let Ok(entry) = entry {
                if entry.file_type().is_file() {
                    total += 1;
                }
            }
        }
    }
    total
}

// Non-UTF-8 paths cannot be recorded, so they are treated as excluded.
fn is_excluded(path: &std::path::Path, exclusions: &ExclusionSet) -> bool {
    Utf8Path::from_path(path).is_none_or(|p| exclusions.is_excluded(p.as_str()))
}

fn count_direct_files(dir: &Utf8Path) -> u64 {
    match fs::read_dir(dir) {
        Ok(entries) => entries
            .flatten()
            .filter(|entry| entry.file_type().is_ok_and(|t| t.is_file()))
            .count() as u64,
        Err(e) => {
            tracing::debug!("Cannot list {}: {}", dir, e);
            0
        }
    }
}

/// Build the record for an application root.
pub fn build_app_record(dir: &Utf8Path, manifest: &KernelManifest) -> AppRecord {
    AppRecord::new(
        dir,
        classifier::detect_version(dir),
        manifest.core_files_size(dir),
    )
}

/// Lazy walk over a set of roots.
pub struct DirectoryWalker {
    roots: VecDeque<Utf8PathBuf>,
    exclusions: ExclusionSet,
    cancel: CancellationToken,
    manifest: KernelManifest,
    current: Option<walkdir::IntoIter>,
    pending: VecDeque<ScanEvent>,
    scanned: u64,
    total: Option<u64>,
    finished: bool,
}

impl DirectoryWalker {
    pub fn new(
        roots: Vec<Utf8PathBuf>,
        exclusions: ExclusionSet,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            roots: roots.into(),
            exclusions,
            cancel,
            manifest: KernelManifest::default(),
            current: None,
            pending: VecDeque::new(),
            scanned: 0,
            total: None,
            finished: false,
        }
    }

    /// Use a custom manifest for application sizes.
    pub fn with_manifest(mut self, manifest: KernelManifest) -> Self {
        self.manifest = manifest;
        self
    }

    /// Files counted so far.
    pub fn scanned(&self) -> u64 {
        self.scanned
    }

    // Visit one directory, queueing its events. Returns false once every root
    // is exhausted.
    fn visit_next_directory(&mut self) -> bool {
        loop {
            if self.current.is_none() {
                let Some(root) = self.roots.pop_front() else {
                    return false;
                };
                if !root.is_dir() {
                    tracing::debug!("Skipping missing scan root {}", root);
                    continue;
                }
                tracing::info!("Scanning {}", root);
                self.current = Some(
                    WalkDir::new(&root)
                        .follow_links(false)
                        .sort_by_file_name()
                        .into_iter(),
                );
            }
            let Some(iter) = self.current.as_mut() else {
                continue;
            };

            let entry = match iter.next() {
                None => {
                    self.current = None;
                    continue;
                }
                Some(Err(e)) => {
                    tracing::debug!("Skipping unreadable path: {}", e);
                    continue;
                }
                Some(Ok(entry)) => entry,
            };

            if !entry.file_type().is_dir() {
                continue;
            }

            let Some(dir) = Utf8Path::from_path(entry.path()).map(Utf8Path::to_path_buf) else {
                iter.skip_current_dir();
                continue;
            };

            if self.exclusions.is_excluded(dir.as_str()) {
                tracing::debug!("Excluded {}", dir);
                iter.skip_current_dir();
                continue;
            }

            self.scanned += count_direct_files(&dir);

            if classifier::is_chromium_app(&dir) {
                // Applications are self-contained; nothing below needs a look
                iter.skip_current_dir();
                let app = build_app_record(&dir, &self.manifest);
                tracing::info!("Found {} ({}) at {}", app.name, app.version, app.path);
                self.pending.push_back(ScanEvent::AppFound(app));
            }

            self.pending.push_back(ScanEvent::Progress {
                scanned: self.scanned,
                total: self.total.unwrap_or(0),
                current_path: dir,
            });
            return true;
        }
    }
}

impl Iterator for DirectoryWalker {
    type Item = ScanEvent;

    fn next(&mut self) -> Option<ScanEvent> {
        if let Some(event) = self.pending.pop_front() {
            return Some(event);
        }
        if self.finished {
            return None;
        }

        if self.total.is_none() {
            let roots: Vec<Utf8PathBuf> = self.roots.iter().cloned().collect();
            self.total = Some(count_files(&roots, &self.exclusions, &self.cancel));
        }

        if self.cancel.is_cancelled() {
            tracing::info!("Scan cancelled after {} files", self.scanned);
            self.finished = true;
            return None;
        }

        if !self.visit_next_directory() {
            self.finished = true;
        }
        self.pending.pop_front()
    }
}
