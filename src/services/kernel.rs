//! Shared kernel location and the catalogue of redirectable files.
//!
//! Eligibility is a two-stage filter. The core list and the resource-bundle
//! patterns are deliberately broad, covering several Chromium-derived browsers
//! and embedding frameworks; the denylist then drops third-party vendor files
//! that happen to match.

use anyhow::{Context, Result, bail};
use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use std::collections::BTreeSet;
use std::fs;
use std::io;
use walkdir::WalkDir;

/// Core runtime files, compared case-insensitively.
pub const CORE_FILES: [&str; 23] = [
    "chrome.dll",
    "chrome_elf.dll",
    "chrome.exe",
    "chrome_child.dll",
    "msedge.dll",
    "msedge_elf.dll",
    "msedge_child.dll",
    "brave.dll",
    "brave_elf.dll",
    "brave_child.dll",
    "libcef.dll",
    "cef_sandbox.dll",
    "electron.exe",
    "widevinecdmadapter.dll",
    "widevinecdmadapter64.dll",
    "pdf.dll",
    "ui.dll",
    "v8_context_snapshot.bin",
    "natives_blob.bin",
    "snapshot_blob.bin",
    "icudtl.dat",
    "libEGL.dll",
    "libGLESv2.dll",
];

/// Resource bundles wanted from an app directory (`.pak` files containing one of these).
pub const BUNDLE_PATTERNS: [&str; 3] = [
    "chrome_100_percent.pak",
    "chrome_200_percent.pak",
    "resources.pak",
];

/// Substrings that disqualify a file even when its name matches.
pub const DENYLIST: [&str; 28] = [
    // System API sets
    "api-ms-win-",
    "ext-ms-win-",
    // C++ runtimes
    "msvcp",
    "vcruntime",
    "concrt140",
    "ucrtbase",
    // Third-party libraries
    "7-zip.dll",
    "ffmpeg.dll",
    "libzmq-",
    "sqlite3",
    // Graphics drivers
    "d3dcompiler_",
    "vk_swiftshader.dll",
    "vulkan-1.dll",
    "qt5",
    // Vendor components
    "adj.dll",
    "aria2c.exe",
    "crashhunter_pc3.dll",
    "fevergames",
    "ipcplugin.dll",
    "mpay.dll",
    "ntunisdk",
    "orbitsdk.dll",
    "qcefview.dll",
    "rlottie.dll",
    "txbugreport.exe",
    "unicrashreporter.exe",
    "wxworkweb.exe",
    "xyvodsdk.dll",
];

/// A supplied kernel is accepted only if this file exists in its root.
pub const KERNEL_IDENTITY_FILE: &str = "chrome.exe";

/// Catalogue of redirectable file names.
#[derive(Debug, Clone)]
pub struct KernelManifest {
    core_files: Vec<String>,
    bundle_pattern: Option<Regex>,
    denylist: Vec<String>,
}

impl KernelManifest {
    /// Build a manifest from explicit lists.
    ///
    /// Core names are matched case-insensitively; bundle patterns are matched
    /// as substrings of `.pak` names; denylist entries as case-insensitive
    /// substrings.
    pub fn new<C, B, D>(core_files: C, bundle_patterns: B, denylist: D) -> Result<Self>
    where
        C: IntoIterator,
        C::Item: AsRef<str>,
        B: IntoIterator,
        B::Item: AsRef<str>,
        D: IntoIterator,
        D::Item: AsRef<str>,
    {
        let alternatives: Vec<String> = bundle_patterns
            .into_iter()
            .map(|p| regex::escape(&p.as_ref().to_lowercase()))
            .collect();
        // An empty alternation would match every .pak file
        let bundle_pattern = if alternatives.is_empty() {
            None
        } else {
            let pattern = format!("(?:{})", alternatives.join("|"));
            Some(Regex::new(&pattern).context("Invalid resource bundle pattern")?)
        };

        Ok(Self {
            core_files: core_files
                .into_iter()
                .map(|c| c.as_ref().to_lowercase())
                .collect(),
            bundle_pattern,
            denylist: denylist
                .into_iter()
                .map(|d| d.as_ref().to_lowercase())
                .collect(),
        })
    }

    pub fn is_core_file(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        self.core_files.iter().any(|c| *c == lower)
    }

    pub fn is_wanted_bundle(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        lower.ends_with(".pak")
            && self
                .bundle_pattern
                .as_ref()
                .is_some_and(|pattern| pattern.is_match(&lower))
    }

    pub fn is_denied(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        self.denylist.iter().any(|d| lower.contains(d.as_str()))
    }

    /// Whether a file name may be redirected.
    pub fn is_eligible(&self, name: &str) -> bool {
        (self.is_core_file(name) || self.is_wanted_bundle(name)) && !self.is_denied(name)
    }

    /// Eligible regular files directly inside `dir`, by their on-disk names.
    ///
    /// Symbolic links are skipped: they are either already redirected or not
    /// ours to touch.
    pub fn eligible_files(&self, dir: &Utf8Path) -> io::Result<BTreeSet<String>> {
        let entries = fs::read_dir(dir)?;

        let mut names = BTreeSet::new();
        for entry in entries.flatten() {
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if !file_type.is_file() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if self.is_eligible(&name) {
                names.insert(name);
            }
        }
        Ok(names)
    }

    /// Total size of the core files present directly in `dir`. Best effort.
    pub fn core_files_size(&self, dir: &Utf8Path) -> u64 {
        let Ok(entries) = fs::read_dir(dir) else {
            return 0;
        };
        entries
            .flatten()
            .filter(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| self.is_core_file(name))
            })
            .filter_map(|entry| entry.metadata().ok())
            .filter(|meta| meta.is_file())
            .map(|meta| meta.len())
            .sum()
    }
}

impl Default for KernelManifest {
    fn default() -> Self {
        Self::new(CORE_FILES, BUNDLE_PATTERNS, DENYLIST).expect("built-in manifest is valid")
    }
}

/// Whether two paths name the same directory once links and `..` are resolved.
///
/// Paths that cannot be resolved are compared as written.
pub fn same_directory(a: &Utf8Path, b: &Utf8Path) -> bool {
    match (a.canonicalize_utf8(), b.canonicalize_utf8()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

// True if `inner` is `outer` or lies somewhere below it.
fn is_within(inner: &Utf8Path, outer: &Utf8Path) -> bool {
    match (inner.canonicalize_utf8(), outer.canonicalize_utf8()) {
        (Ok(inner), Ok(outer)) => inner.starts_with(outer),
        _ => inner.starts_with(outer),
    }
}

/// Populates a directory with a complete Chromium runtime.
pub trait KernelSupplier {
    fn populate(&self, target: &Utf8Path) -> Result<()>;
}

/// Supplies a kernel by copying an already unpacked runtime directory.
#[derive(Debug, Clone)]
pub struct LocalDirectorySupplier {
    source: Utf8PathBuf,
}

impl LocalDirectorySupplier {
    pub fn new(source: impl Into<Utf8PathBuf>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

impl KernelSupplier for LocalDirectorySupplier {
    fn populate(&self, target: &Utf8Path) -> Result<()> {
        if !self.source.is_dir() {
            bail!("Kernel source is not a directory: {}", self.source);
        }
        fs::create_dir_all(target)
            .with_context(|| format!("Failed to create kernel directory: {}", target))?;
        if is_within(target, &self.source) {
            bail!(
                "Kernel target {} lies inside its source {}",
                target,
                self.source
            );
        }

        let mut copied = 0usize;
        for entry in WalkDir::new(&self.source) {
            let entry = entry.with_context(|| format!("Failed to walk {}", self.source))?;
            let relative = entry
                .path()
                .strip_prefix(&self.source)
                .context("Walked outside the kernel source")?;
            let destination = target.as_std_path().join(relative);

            if entry.file_type().is_dir() {
                fs::create_dir_all(&destination)
                    .with_context(|| format!("Failed to create {}", destination.display()))?;
            } else if entry.file_type().is_file() {
                fs::copy(entry.path(), &destination)
                    .with_context(|| format!("Failed to copy {}", entry.path().display()))?;
                copied += 1;
            }
        }

        tracing::info!("Copied {} kernel files from {} to {}", copied, self.source, target);
        Ok(())
    }
}

/// The active shared kernel and the manifest used to resolve redirectable files.
#[derive(Debug, Clone, Default)]
pub struct KernelRegistry {
    manifest: KernelManifest,
    root: Option<Utf8PathBuf>,
}

impl KernelRegistry {
    pub fn new(manifest: KernelManifest, root: Option<Utf8PathBuf>) -> Self {
        Self { manifest, root }
    }

    /// Registry with the built-in manifest and the given root.
    pub fn with_root(root: Option<Utf8PathBuf>) -> Self {
        Self::new(KernelManifest::default(), root)
    }

    pub fn manifest(&self) -> &KernelManifest {
        &self.manifest
    }

    pub fn root(&self) -> Option<&Utf8Path> {
        self.root.as_deref()
    }

    pub fn activate(&mut self, root: impl Into<Utf8PathBuf>) {
        let root = root.into();
        tracing::info!("Shared kernel activated at {}", root);
        self.root = Some(root);
    }

    /// Eligible file names present in an application directory.
    pub fn resolve(&self, app_path: &Utf8Path) -> io::Result<BTreeSet<String>> {
        self.manifest.eligible_files(app_path)
    }

    /// Whether `root` holds a usable kernel.
    pub fn is_usable(root: &Utf8Path) -> bool {
        root.join(KERNEL_IDENTITY_FILE).is_file()
    }

    /// Run a supplier into `target` and activate the result if it is usable.
    pub fn install_from_supplier(
        &mut self,
        supplier: &dyn KernelSupplier,
        target: &Utf8Path,
    ) -> Result<()> {
        supplier
            .populate(target)
            .with_context(|| format!("Kernel supplier failed for {}", target))?;

        if !Self::is_usable(target) {
            bail!(
                "Supplied kernel at {} has no {}",
                target,
                KERNEL_IDENTITY_FILE
            );
        }

        self.activate(target);
        Ok(())
    }

    /// Copy every eligible file of `source` into `target`, never linking.
    ///
    /// Returns the copied names.
    pub fn copy_kernel_files(&self, source: &Utf8Path, target: &Utf8Path) -> Result<Vec<String>> {
        fs::create_dir_all(target)
            .with_context(|| format!("Failed to create kernel directory: {}", target))?;
        if same_directory(source, target) {
            bail!("Kernel source and target are the same directory: {}", target);
        }

        let mut copied = Vec::new();
        let names = self
            .resolve(source)
            .with_context(|| format!("Failed to list directory: {}", source))?;
        for name in names {
            fs::copy(source.join(&name), target.join(&name))
                .with_context(|| format!("Failed to copy {} into {}", name, target))?;
            copied.push(name);
        }
        Ok(copied)
    }
}
