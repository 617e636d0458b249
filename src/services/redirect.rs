//! Backup, link swap and restore of application kernels.
//!
//! Redirecting an application copies its eligible kernel files into
//! `<app>/backup_chrome`, then replaces each original with a symbolic link of
//! the same name pointing into the shared kernel. The backup directory is the
//! authoritative record that an app is redirected; the registry index is a
//! cache reconciled against it.
//!
//! Every public operation returns `Result<_, RedirectError>`. Per-file
//! failures never abort an operation: they are collected and the pure
//! [`decide_outcome`] fold settles whether the redirect is kept or rolled back.

use crate::config::AppRegistry;
use crate::metrics::Metrics;
use crate::models::{AppRecord, RedirectionState};
use crate::services::kernel::{KernelRegistry, KernelSupplier, same_directory};
use camino::{Utf8Path, Utf8PathBuf};
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Name of the backup directory inside an application directory.
pub const BACKUP_DIR_NAME: &str = "backup_chrome";

/// Location of the backup directory for an application.
pub fn backup_dir(app_path: &Utf8Path) -> Utf8PathBuf {
    app_path.join(BACKUP_DIR_NAME)
}

/// Why a single file could not be processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The shared kernel has no file of that name.
    SourceMissing,
    PermissionDenied,
    Io,
}

/// A per-file failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFailure {
    pub name: String,
    pub kind: FailureKind,
    pub detail: String,
}

impl FileFailure {
    fn from_io(name: &str, error: &io::Error) -> Self {
        let kind = if error.kind() == io::ErrorKind::PermissionDenied {
            FailureKind::PermissionDenied
        } else {
            FailureKind::Io
        };
        Self {
            name: name.to_string(),
            kind,
            detail: error.to_string(),
        }
    }

    fn source_missing(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: FailureKind::SourceMissing,
            detail: "not present in shared kernel".to_string(),
        }
    }
}

impl fmt::Display for FileFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.detail)
    }
}

fn format_failures(failures: &[FileFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn any_permission_denied(failures: &[FileFailure]) -> bool {
    failures
        .iter()
        .any(|f| f.kind == FailureKind::PermissionDenied)
}

/// Result of the link step for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    Linked(String),
    Failed(FileFailure),
}

/// Whether a redirect is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectDecision {
    Accept,
    RollBack,
}

/// Decide the fate of a redirect from its per-file outcomes.
///
/// A single link is enough to keep the redirect; with none, the app must be
/// put back exactly as it was.
pub fn decide_outcome(outcomes: &[LinkOutcome]) -> RedirectDecision {
    if outcomes
        .iter()
        .any(|outcome| matches!(outcome, LinkOutcome::Linked(_)))
    {
        RedirectDecision::Accept
    } else {
        RedirectDecision::RollBack
    }
}

/// Coarse classification of a [`RedirectError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Rejected before anything was changed.
    Validation,
    /// Some files were processed, some were not.
    PartialIo,
    /// Nothing was achieved; any change was rolled back.
    FatalIo,
    /// The operating system refused access.
    Permission,
}

#[derive(Debug, Error)]
pub enum RedirectError {
    #[error("Shared kernel path is not set")]
    KernelNotSet,

    #[error("Shared kernel directory does not exist: {0}")]
    KernelMissing(Utf8PathBuf),

    #[error("Application directory does not exist: {0}")]
    AppMissing(Utf8PathBuf),

    #[error("{0} is the shared kernel directory")]
    AppIsKernel(Utf8PathBuf),

    #[error("{0} is already redirected")]
    AlreadyRedirected(Utf8PathBuf),

    #[error("{0} is not redirected")]
    NotRedirected(Utf8PathBuf),

    #[error("No redirectable kernel files in {0}")]
    NothingToRedirect(Utf8PathBuf),

    #[error("Backup of {0} is still needed: kernel files are linked or missing")]
    BackupInUse(Utf8PathBuf),

    #[error("Permission denied: {path}")]
    PermissionDenied {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("No file of {path} could be linked: {}", format_failures(.failures))]
    NoFilesLinked {
        path: Utf8PathBuf,
        failures: Vec<FileFailure>,
    },

    #[error("Rollback of {path} failed, backup kept: {}", format_failures(.failures))]
    RollbackFailed {
        path: Utf8PathBuf,
        failures: Vec<FileFailure>,
    },

    #[error("Restore of {path} incomplete ({restored} restored), backup kept: {}", format_failures(.failures))]
    RestoreIncomplete {
        path: Utf8PathBuf,
        restored: usize,
        failures: Vec<FileFailure>,
    },

    #[error("Shared kernel setup failed: {0}")]
    KernelSetup(String),

    #[error(transparent)]
    Registry(#[from] anyhow::Error),
}

impl RedirectError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RedirectError::KernelNotSet
            | RedirectError::KernelMissing(_)
            | RedirectError::AppMissing(_)
            | RedirectError::AppIsKernel(_)
            | RedirectError::AlreadyRedirected(_)
            | RedirectError::NotRedirected(_)
            | RedirectError::NothingToRedirect(_)
            | RedirectError::BackupInUse(_) => ErrorClass::Validation,
            RedirectError::PermissionDenied { .. } => ErrorClass::Permission,
            RedirectError::RestoreIncomplete { .. } => ErrorClass::PartialIo,
            RedirectError::Io { .. }
            | RedirectError::NoFilesLinked { .. }
            | RedirectError::RollbackFailed { .. }
            | RedirectError::KernelSetup(_)
            | RedirectError::Registry(_) => ErrorClass::FatalIo,
        }
    }

    /// True when retrying with elevated privileges could help.
    pub fn requires_elevation(&self) -> bool {
        match self {
            RedirectError::PermissionDenied { .. } => true,
            RedirectError::NoFilesLinked { failures, .. }
            | RedirectError::RollbackFailed { failures, .. }
            | RedirectError::RestoreIncomplete { failures, .. } => {
                any_permission_denied(failures)
            }
            _ => false,
        }
    }
}

fn io_error(path: &Utf8Path, source: io::Error) -> RedirectError {
    if source.kind() == io::ErrorKind::PermissionDenied {
        RedirectError::PermissionDenied {
            path: path.to_path_buf(),
            source,
        }
    } else {
        RedirectError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// An accepted redirect.
#[derive(Debug, Clone, PartialEq)]
pub struct RedirectReport {
    pub app: Utf8PathBuf,
    pub linked: Vec<String>,
    pub failures: Vec<FileFailure>,
}

impl RedirectReport {
    pub fn total(&self) -> usize {
        self.linked.len() + self.failures.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn requires_elevation(&self) -> bool {
        any_permission_denied(&self.failures)
    }

    pub fn message(&self) -> String {
        if self.is_complete() {
            format!("Redirected {}/{} files", self.linked.len(), self.total())
        } else {
            format!(
                "Partially redirected ({}/{}): {}",
                self.linked.len(),
                self.total(),
                format_failures(&self.failures)
            )
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RestoreReport {
    pub app: Utf8PathBuf,
    pub restored: Vec<String>,
}

impl RestoreReport {
    pub fn message(&self) -> String {
        format!("Restored {} files", self.restored.len())
    }
}

/// Per-app line of a batch result.
#[derive(Debug, Clone, PartialEq)]
pub struct AppOperationResult {
    pub app: Utf8PathBuf,
    pub success: bool,
    pub message: String,
    pub requires_elevation: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub success_count: usize,
    pub fail_count: usize,
    pub results: Vec<AppOperationResult>,
}

impl BatchReport {
    fn push(&mut self, result: AppOperationResult) {
        if result.success {
            self.success_count += 1;
        } else {
            self.fail_count += 1;
        }
        self.results.push(result);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupFile {
    pub name: String,
    pub size: u64,
}

/// Contents of one backup directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupInfo {
    pub app: Utf8PathBuf,
    pub backup_path: Utf8PathBuf,
    pub files: Vec<BackupFile>,
    pub total_size: u64,
}

/// Changes made to the redirected index by [`RedirectEngine::reconcile_index`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: Vec<Utf8PathBuf>,
    pub removed: Vec<Utf8PathBuf>,
    /// Apps that need a restore before they can be redirected again.
    pub partial: Vec<Utf8PathBuf>,
}

fn backup_exists(app_path: &Utf8Path) -> bool {
    fs::symlink_metadata(backup_dir(app_path)).is_ok()
}

// Regular files in a backup directory, sorted.
fn backup_file_names(backup: &Utf8Path) -> io::Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    for entry in fs::read_dir(backup)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Ok(name) = entry.file_name().into_string() {
            names.insert(name);
        }
    }
    Ok(names)
}

fn is_symlink(path: &Utf8Path) -> bool {
    fs::symlink_metadata(path).is_ok_and(|meta| meta.file_type().is_symlink())
}

/// Redirection state of an application, from its directory contents alone.
pub fn redirection_state(app_path: &Utf8Path) -> RedirectionState {
    let backup = backup_dir(app_path);
    if fs::symlink_metadata(&backup).is_err() {
        return RedirectionState::Unredirected;
    }

    let Ok(names) = backup_file_names(&backup) else {
        return RedirectionState::PartiallyRedirected;
    };

    let mut any_linked = false;
    for name in &names {
        match fs::symlink_metadata(app_path.join(name)) {
            Ok(meta) if meta.file_type().is_symlink() => any_linked = true,
            Ok(_) => {}
            Err(_) => return RedirectionState::PartiallyRedirected,
        }
    }

    if any_linked {
        RedirectionState::Redirected
    } else {
        RedirectionState::PartiallyRedirected
    }
}

/// Filesystem primitives used to mutate application directories.
///
/// Everything the engine writes into an app or its backup goes through this
/// trait.
pub trait FileOps: Send + Sync {
    /// Copy a regular file, replacing `to`.
    fn copy(&self, from: &Utf8Path, to: &Utf8Path) -> io::Result<u64>;

    /// Create a symbolic link at `link` pointing to the file `source`.
    fn link(&self, source: &Utf8Path, link: &Utf8Path) -> io::Result<()>;
}

/// [`FileOps`] on the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileOps;

impl FileOps for LocalFileOps {
    fn copy(&self, from: &Utf8Path, to: &Utf8Path) -> io::Result<u64> {
        fs::copy(from, to)
    }

    fn link(&self, source: &Utf8Path, link: &Utf8Path) -> io::Result<()> {
        create_file_link(source, link)
    }
}

fn create_file_link(source: &Utf8Path, link: &Utf8Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(source, link)
    }

    #[cfg(windows)]
    {
        std::os::windows::fs::symlink_file(source, link)
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = (source, link);
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "symbolic links are not supported on this platform",
        ))
    }
}

// Clear whatever occupies `path`, following nothing.
fn remove_existing(path: &Utf8Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

// Copy each named backup file over the app's entry of the same name.
// Continues past failures.
fn restore_files<'a>(
    files: &dyn FileOps,
    app_path: &Utf8Path,
    backup: &Utf8Path,
    names: impl IntoIterator<Item = &'a String>,
) -> (Vec<String>, Vec<FileFailure>) {
    let mut restored = Vec::new();
    let mut failures = Vec::new();

    for name in names {
        let target = app_path.join(name);
        let result =
            remove_existing(&target).and_then(|()| files.copy(&backup.join(name), &target));
        match result {
            Ok(_) => restored.push(name.clone()),
            Err(e) => {
                tracing::warn!("Failed to restore {}: {}", target, e);
                failures.push(FileFailure::from_io(name, &e));
            }
        }
    }

    (restored, failures)
}

fn absolute(path: &Utf8Path) -> Utf8PathBuf {
    std::path::absolute(path)
        .ok()
        .and_then(|p| Utf8PathBuf::from_path_buf(p).ok())
        .unwrap_or_else(|| path.to_path_buf())
}

/// Orchestrates redirect and restore against a registry and a kernel.
pub struct RedirectEngine<R: AppRegistry> {
    registry: R,
    kernel: KernelRegistry,
    metrics: Arc<Metrics>,
    files: Box<dyn FileOps>,
}

impl<R: AppRegistry> RedirectEngine<R> {
    pub fn new(registry: R, kernel: KernelRegistry) -> Self {
        Self {
            registry,
            kernel,
            metrics: Arc::new(Metrics::new()),
            files: Box::new(LocalFileOps),
        }
    }

    /// Engine whose kernel root is the persisted `shared_kernel_path`.
    pub fn from_registry(registry: R) -> Result<Self, RedirectError> {
        let document = registry.load()?;
        let kernel = KernelRegistry::with_root(document.shared_kernel_path);
        Ok(Self::new(registry, kernel))
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_file_ops(mut self, files: impl FileOps + 'static) -> Self {
        self.files = Box::new(files);
        self
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    pub fn kernel(&self) -> &KernelRegistry {
        &self.kernel
    }

    fn validate_redirect(&self, app: &AppRecord) -> Result<Utf8PathBuf, RedirectError> {
        let kernel_root = self.kernel.root().ok_or(RedirectError::KernelNotSet)?;
        if !kernel_root.is_dir() {
            return Err(RedirectError::KernelMissing(kernel_root.to_path_buf()));
        }
        if !app.path.is_dir() {
            return Err(RedirectError::AppMissing(app.path.clone()));
        }
        if same_directory(&app.path, kernel_root) {
            return Err(RedirectError::AppIsKernel(app.path.clone()));
        }
        if backup_exists(&app.path) {
            return Err(RedirectError::AlreadyRedirected(app.path.clone()));
        }
        Ok(absolute(kernel_root))
    }

    // Copy every name into a fresh backup directory. On failure the partial
    // backup is removed; originals are untouched at this point.
    fn create_backup(
        &self,
        app_path: &Utf8Path,
        backup: &Utf8Path,
        names: &BTreeSet<String>,
    ) -> Result<(), RedirectError> {
        fs::create_dir(backup).map_err(|e| io_error(backup, e))?;

        for name in names {
            let source = app_path.join(name);
            if let Err(e) = self.files.copy(&source, &backup.join(name)) {
                if let Err(cleanup) = fs::remove_dir_all(backup) {
                    tracing::error!("Failed to remove partial backup {}: {}", backup, cleanup);
                }
                return Err(io_error(&source, e));
            }
        }
        Ok(())
    }

    fn link_file(
        &self,
        app_path: &Utf8Path,
        backup: &Utf8Path,
        kernel_root: &Utf8Path,
        name: &str,
    ) -> LinkOutcome {
        let source = kernel_root.join(name);
        if !source.is_file() {
            return LinkOutcome::Failed(FileFailure::source_missing(name));
        }

        let original = app_path.join(name);
        if let Err(e) = fs::remove_file(&original) {
            return LinkOutcome::Failed(FileFailure::from_io(name, &e));
        }

        match self.files.link(&source, &original) {
            Ok(()) => LinkOutcome::Linked(name.to_string()),
            Err(e) => {
                let mut failure = FileFailure::from_io(name, &e);
                if let Err(put_back) = self.files.copy(&backup.join(name), &original) {
                    tracing::error!(
                        "Failed to put back {} after link failure: {}",
                        original,
                        put_back
                    );
                    failure.detail = format!(
                        "{}; original missing ({}), restore required",
                        failure.detail, put_back
                    );
                }
                LinkOutcome::Failed(failure)
            }
        }
    }

    /// Replace the app's kernel files with links into the shared kernel.
    pub fn redirect(&self, app: &AppRecord) -> Result<RedirectReport, RedirectError> {
        let result = self.try_redirect(app);
        if result.is_err() {
            self.metrics.record_redirect_failed();
        }
        result
    }

    fn try_redirect(&self, app: &AppRecord) -> Result<RedirectReport, RedirectError> {
        let kernel_root = self.validate_redirect(app)?;

        let names = self
            .kernel
            .resolve(&app.path)
            .map_err(|e| io_error(&app.path, e))?;
        if names.is_empty() {
            return Err(RedirectError::NothingToRedirect(app.path.clone()));
        }

        let backup = backup_dir(&app.path);
        self.create_backup(&app.path, &backup, &names)?;
        tracing::info!("Backed up {} kernel files of {}", names.len(), app.path);

        let outcomes: Vec<LinkOutcome> = names
            .iter()
            .map(|name| self.link_file(&app.path, &backup, &kernel_root, name))
            .collect();

        let mut linked = Vec::new();
        let mut failures = Vec::new();
        for outcome in outcomes.iter().cloned() {
            match outcome {
                LinkOutcome::Linked(name) => linked.push(name),
                LinkOutcome::Failed(failure) => {
                    tracing::warn!(
                        "Could not link {} in {}: {}",
                        failure.name,
                        app.path,
                        failure.detail
                    );
                    failures.push(failure);
                }
            }
        }

        if decide_outcome(&outcomes) == RedirectDecision::RollBack {
            return Err(self.roll_back(&app.path, &backup, &names, failures));
        }

        if let Err(e) = self.registry.add_redirected_app(app) {
            // The backup on disk is authoritative; reconcile_index repairs this
            tracing::warn!("Failed to index {} as redirected: {:#}", app.path, e);
        }

        let bytes: u64 = linked
            .iter()
            .filter_map(|name| fs::metadata(backup.join(name)).ok())
            .map(|meta| meta.len())
            .sum();
        self.metrics.record_app_redirected(linked.len() as u64, bytes);

        let report = RedirectReport {
            app: app.path.clone(),
            linked,
            failures,
        };
        tracing::info!("{}: {}", app.name, report.message());
        Ok(report)
    }

    // Put every original back and drop the backup. The backup stays if any
    // file could not be put back.
    fn roll_back(
        &self,
        app_path: &Utf8Path,
        backup: &Utf8Path,
        names: &BTreeSet<String>,
        link_failures: Vec<FileFailure>,
    ) -> RedirectError {
        tracing::warn!("No file of {} could be linked, rolling back", app_path);

        let (_, rollback_failures) = restore_files(self.files.as_ref(), app_path, backup, names);
        if !rollback_failures.is_empty() {
            return RedirectError::RollbackFailed {
                path: app_path.to_path_buf(),
                failures: rollback_failures,
            };
        }

        if let Err(e) = fs::remove_dir_all(backup) {
            tracing::error!("Failed to remove backup {} after rollback: {}", backup, e);
            return RedirectError::RollbackFailed {
                path: app_path.to_path_buf(),
                failures: vec![FileFailure::from_io(BACKUP_DIR_NAME, &e)],
            };
        }

        RedirectError::NoFilesLinked {
            path: app_path.to_path_buf(),
            failures: link_failures,
        }
    }

    /// Put the backed-up kernel files back and remove the backup.
    ///
    /// Files already restored stay restored when another fails; the backup
    /// is kept so the restore can be retried.
    pub fn restore(&self, app: &AppRecord) -> Result<RestoreReport, RedirectError> {
        let result = self.try_restore(app);
        if result.is_err() {
            self.metrics.record_restore_failed();
        }
        result
    }

    fn try_restore(&self, app: &AppRecord) -> Result<RestoreReport, RedirectError> {
        let backup = backup_dir(&app.path);
        if !backup.is_dir() {
            return Err(RedirectError::NotRedirected(app.path.clone()));
        }

        let names = backup_file_names(&backup).map_err(|e| io_error(&backup, e))?;
        let (restored, failures) = restore_files(self.files.as_ref(), &app.path, &backup, &names);

        if !failures.is_empty() {
            return Err(RedirectError::RestoreIncomplete {
                path: app.path.clone(),
                restored: restored.len(),
                failures,
            });
        }

        fs::remove_dir_all(&backup).map_err(|e| io_error(&backup, e))?;

        if let Err(e) = self.registry.remove_redirected_app(&app.path) {
            tracing::warn!("Failed to unindex {}: {:#}", app.path, e);
        }
        self.metrics.record_app_restored();

        let report = RestoreReport {
            app: app.path.clone(),
            restored,
        };
        tracing::info!("{}: {}", app.name, report.message());
        Ok(report)
    }

    /// Redirect each app in turn. One failure never stops the batch.
    pub fn redirect_all(&self, apps: &[AppRecord]) -> BatchReport {
        let mut batch = BatchReport::default();
        for app in apps {
            batch.push(match self.redirect(app) {
                Ok(report) => AppOperationResult {
                    app: app.path.clone(),
                    success: true,
                    message: report.message(),
                    requires_elevation: report.requires_elevation(),
                },
                Err(e) => {
                    tracing::warn!("Redirect of {} failed: {}", app.path, e);
                    AppOperationResult {
                        app: app.path.clone(),
                        success: false,
                        message: e.to_string(),
                        requires_elevation: e.requires_elevation(),
                    }
                }
            });
        }
        tracing::info!(
            "Batch redirect: {} succeeded, {} failed",
            batch.success_count,
            batch.fail_count
        );
        batch
    }

    /// Restore each app in turn. One failure never stops the batch.
    pub fn restore_all(&self, apps: &[AppRecord]) -> BatchReport {
        let mut batch = BatchReport::default();
        for app in apps {
            batch.push(match self.restore(app) {
                Ok(report) => AppOperationResult {
                    app: app.path.clone(),
                    success: true,
                    message: report.message(),
                    requires_elevation: false,
                },
                Err(e) => {
                    tracing::warn!("Restore of {} failed: {}", app.path, e);
                    AppOperationResult {
                        app: app.path.clone(),
                        success: false,
                        message: e.to_string(),
                        requires_elevation: e.requires_elevation(),
                    }
                }
            });
        }
        tracing::info!(
            "Batch restore: {} succeeded, {} failed",
            batch.success_count,
            batch.fail_count
        );
        batch
    }

    /// Seed the shared kernel with copies of an app's kernel files.
    ///
    /// The app itself is neither backed up nor modified.
    pub fn initialize_shared_kernel_from_app(
        &mut self,
        app: &AppRecord,
        target: &Utf8Path,
    ) -> Result<Vec<String>, RedirectError> {
        if !app.path.is_dir() {
            return Err(RedirectError::AppMissing(app.path.clone()));
        }
        let names = self
            .kernel
            .resolve(&app.path)
            .map_err(|e| io_error(&app.path, e))?;
        if names.is_empty() {
            return Err(RedirectError::NothingToRedirect(app.path.clone()));
        }
        // Copying a file onto itself truncates it
        if same_directory(&app.path, target) {
            return Err(RedirectError::AppIsKernel(app.path.clone()));
        }

        let copied = self
            .kernel
            .copy_kernel_files(&app.path, target)
            .map_err(|e| RedirectError::KernelSetup(format!("{:#}", e)))?;

        self.kernel.activate(target);
        self.registry
            .set_shared_kernel_path(Some(target.to_path_buf()))?;

        tracing::info!(
            "Shared kernel initialized from {} with {} files",
            app.path,
            copied.len()
        );
        Ok(copied)
    }

    /// Point the engine at an existing kernel directory.
    pub fn set_shared_kernel(&mut self, root: &Utf8Path) -> Result<(), RedirectError> {
        if !root.is_dir() {
            return Err(RedirectError::KernelMissing(root.to_path_buf()));
        }
        let root = absolute(root);
        self.kernel.activate(&root);
        self.registry.set_shared_kernel_path(Some(root))?;
        Ok(())
    }

    /// Populate `target` from a supplier and use it as the shared kernel.
    pub fn install_shared_kernel(
        &mut self,
        supplier: &dyn KernelSupplier,
        target: &Utf8Path,
    ) -> Result<(), RedirectError> {
        self.kernel
            .install_from_supplier(supplier, target)
            .map_err(|e| RedirectError::KernelSetup(format!("{:#}", e)))?;
        self.registry
            .set_shared_kernel_path(Some(target.to_path_buf()))?;
        Ok(())
    }

    pub fn redirection_state(&self, app_path: &Utf8Path) -> RedirectionState {
        redirection_state(app_path)
    }

    /// Bring the redirected index in line with the backups on disk.
    pub fn reconcile_index(&self) -> Result<ReconcileReport, RedirectError> {
        let mut document = self.registry.load()?;
        let mut report = ReconcileReport::default();

        let mut seen = BTreeSet::new();
        let candidates: Vec<AppRecord> = document
            .redirected_apps
            .iter()
            .chain(document.detected_apps.iter())
            .filter(|app| seen.insert(app.path.clone()))
            .cloned()
            .collect();

        for app in candidates {
            let indexed = document.is_indexed_redirected(&app.path);
            match redirection_state(&app.path) {
                RedirectionState::Redirected if !indexed => {
                    document.index_redirected(&app);
                    report.added.push(app.path);
                }
                RedirectionState::Unredirected if indexed => {
                    document.unindex_redirected(&app.path);
                    report.removed.push(app.path);
                }
                RedirectionState::PartiallyRedirected => report.partial.push(app.path),
                _ => {}
            }
        }

        if !report.added.is_empty() || !report.removed.is_empty() {
            self.registry.save(&document)?;
        }
        tracing::info!(
            "Reconciled index: {} added, {} removed, {} partial",
            report.added.len(),
            report.removed.len(),
            report.partial.len()
        );
        Ok(report)
    }

    /// Files held in an app's backup directory.
    pub fn backup_info(&self, app_path: &Utf8Path) -> Result<BackupInfo, RedirectError> {
        let backup = backup_dir(app_path);
        if !backup.is_dir() {
            return Err(RedirectError::NotRedirected(app_path.to_path_buf()));
        }

        let names = backup_file_names(&backup).map_err(|e| io_error(&backup, e))?;
        let mut files = Vec::with_capacity(names.len());
        for name in names {
            let size = fs::metadata(backup.join(&name))
                .map_err(|e| io_error(&backup.join(&name), e))?
                .len();
            files.push(BackupFile { name, size });
        }
        let total_size = files.iter().map(|f| f.size).sum();

        Ok(BackupInfo {
            app: app_path.to_path_buf(),
            backup_path: backup,
            files,
            total_size,
        })
    }

    /// Backups of every known app.
    pub fn list_backups(&self) -> Result<Vec<BackupInfo>, RedirectError> {
        let document = self.registry.load()?;
        let paths: BTreeSet<&Utf8Path> = document
            .redirected_apps
            .iter()
            .chain(document.detected_apps.iter())
            .map(|app| app.path.as_path())
            .collect();

        let mut backups = Vec::new();
        for path in paths {
            if !backup_dir(path).is_dir() {
                continue;
            }
            match self.backup_info(path) {
                Ok(info) => backups.push(info),
                Err(e) => tracing::warn!("Cannot read backup of {}: {}", path, e),
            }
        }
        Ok(backups)
    }

    /// Delete a leftover backup whose originals are all back in place.
    ///
    /// Refused while any backed-up name is a link or missing, since the
    /// backup is then the only copy of that file.
    pub fn discard_backup(&self, app_path: &Utf8Path) -> Result<(), RedirectError> {
        let backup = backup_dir(app_path);
        if !backup.is_dir() {
            return Err(RedirectError::NotRedirected(app_path.to_path_buf()));
        }

        let names = backup_file_names(&backup).map_err(|e| io_error(&backup, e))?;
        let in_use = names.iter().any(|name| {
            let path = app_path.join(name);
            is_symlink(&path) || !path.is_file()
        });
        if in_use {
            return Err(RedirectError::BackupInUse(app_path.to_path_buf()));
        }

        fs::remove_dir_all(&backup).map_err(|e| io_error(&backup, e))?;
        if let Err(e) = self.registry.remove_redirected_app(app_path) {
            tracing::warn!("Failed to unindex {}: {:#}", app_path, e);
        }
        tracing::info!("Discarded backup of {}", app_path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MockAppRegistry;
    use proptest::prelude::*;

    fn failure(name: &str, kind: FailureKind) -> FileFailure {
        FileFailure {
            name: name.to_string(),
            kind,
            detail: "boom".to_string(),
        }
    }

    #[test]
    fn test_decide_outcome() {
        assert_eq!(decide_outcome(&[]), RedirectDecision::RollBack);
        assert_eq!(
            decide_outcome(&[LinkOutcome::Failed(failure("a", FailureKind::Io))]),
            RedirectDecision::RollBack
        );
        assert_eq!(
            decide_outcome(&[
                LinkOutcome::Failed(failure("a", FailureKind::SourceMissing)),
                LinkOutcome::Linked("b".to_string()),
            ]),
            RedirectDecision::Accept
        );
    }

    #[test]
    fn test_error_classes() {
        let path = Utf8PathBuf::from("/apps/Slack");
        assert_eq!(
            RedirectError::AlreadyRedirected(path.clone()).class(),
            ErrorClass::Validation
        );
        assert_eq!(RedirectError::KernelNotSet.class(), ErrorClass::Validation);
        assert_eq!(
            RedirectError::RestoreIncomplete {
                path: path.clone(),
                restored: 1,
                failures: vec![failure("chrome.dll", FailureKind::Io)],
            }
            .class(),
            ErrorClass::PartialIo
        );
        assert_eq!(
            io_error(&path, io::Error::from(io::ErrorKind::PermissionDenied)).class(),
            ErrorClass::Permission
        );
        assert_eq!(
            io_error(&path, io::Error::from(io::ErrorKind::NotFound)).class(),
            ErrorClass::FatalIo
        );
    }

    #[test]
    fn test_requires_elevation() {
        let path = Utf8PathBuf::from("/apps/Slack");
        assert!(io_error(&path, io::Error::from(io::ErrorKind::PermissionDenied)).requires_elevation());
        assert!(
            RedirectError::NoFilesLinked {
                path: path.clone(),
                failures: vec![
                    failure("a", FailureKind::SourceMissing),
                    failure("b", FailureKind::PermissionDenied),
                ],
            }
            .requires_elevation()
        );
        assert!(!RedirectError::NotRedirected(path).requires_elevation());
    }

    #[test]
    fn test_report_message() {
        let complete = RedirectReport {
            app: "/apps/Slack".into(),
            linked: vec!["chrome.dll".into(), "resources.pak".into()],
            failures: vec![],
        };
        assert_eq!(complete.message(), "Redirected 2/2 files");

        let partial = RedirectReport {
            failures: vec![failure("chrome.exe", FailureKind::SourceMissing)],
            ..complete
        };
        assert_eq!(
            partial.message(),
            "Partially redirected (2/3): chrome.exe (boom)"
        );
    }

    #[test]
    fn test_validation_happens_before_any_registry_call() {
        // No expectations: any registry call would panic
        let mock = MockAppRegistry::new();
        let engine = RedirectEngine::new(mock, KernelRegistry::default());
        let app = AppRecord::new("/definitely/not/here", "unknown", 0);

        assert!(matches!(engine.redirect(&app), Err(RedirectError::KernelNotSet)));
        assert!(matches!(engine.restore(&app), Err(RedirectError::NotRedirected(_))));
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use tempfile::TempDir;

        struct Fixture {
            _temp: TempDir,
            kernel: Utf8PathBuf,
            app: AppRecord,
        }

        fn fixture(kernel_files: &[&str]) -> Fixture {
            let temp = TempDir::new().unwrap();
            let root = Utf8PathBuf::try_from(temp.path().to_path_buf()).unwrap();
            let kernel = root.join("SharedChrome");
            let app_dir = root.join("Slack");
            fs::create_dir_all(&kernel).unwrap();
            fs::create_dir_all(&app_dir).unwrap();

            for name in kernel_files {
                fs::write(kernel.join(name), format!("shared {}", name)).unwrap();
            }
            for name in ["chrome.dll", "chrome.exe", "resources.pak", "Slack.exe"] {
                fs::write(app_dir.join(name), format!("own {}", name)).unwrap();
            }

            Fixture {
                _temp: temp,
                app: AppRecord::new(&app_dir, "unknown", 0),
                kernel,
            }
        }

        #[test]
        fn test_accepted_redirect_is_indexed_once() {
            let f = fixture(&["chrome.dll", "chrome.exe", "resources.pak"]);
            let expected = f.app.path.clone();

            let mut mock = MockAppRegistry::new();
            mock.expect_add_redirected_app()
                .withf(move |app| app.path == expected)
                .times(1)
                .returning(|_| Ok(true));

            let engine = RedirectEngine::new(mock, KernelRegistry::with_root(Some(f.kernel)));
            let report = engine.redirect(&f.app).unwrap();

            assert_eq!(report.linked.len(), 3);
            assert!(report.is_complete());
            assert_eq!(redirection_state(&f.app.path), RedirectionState::Redirected);
        }

        #[test]
        fn test_index_write_failure_is_not_fatal() {
            let f = fixture(&["chrome.dll"]);

            let mut mock = MockAppRegistry::new();
            mock.expect_add_redirected_app()
                .times(1)
                .returning(|_| Err(anyhow::anyhow!("disk full")));

            let engine = RedirectEngine::new(mock, KernelRegistry::with_root(Some(f.kernel)));
            let report = engine.redirect(&f.app).unwrap();

            assert_eq!(report.linked, vec!["chrome.dll".to_string()]);
            assert_eq!(report.failures.len(), 2);
        }

        #[test]
        fn test_rolled_back_redirect_is_never_indexed() {
            let f = fixture(&[]);
            let mock = MockAppRegistry::new();

            let engine = RedirectEngine::new(mock, KernelRegistry::with_root(Some(f.kernel)));
            let err = engine.redirect(&f.app).unwrap_err();

            assert!(matches!(err, RedirectError::NoFilesLinked { ref failures, .. } if failures.len() == 3));
            assert!(!backup_dir(&f.app.path).exists());
            assert_eq!(
                fs::read_to_string(f.app.path.join("chrome.dll")).unwrap(),
                "own chrome.dll"
            );
        }

        #[test]
        fn test_restore_unindexes() {
            let f = fixture(&["chrome.dll"]);
            let expected = f.app.path.clone();

            let mut mock = MockAppRegistry::new();
            mock.expect_add_redirected_app().returning(|_| Ok(true));
            mock.expect_remove_redirected_app()
                .withf(move |path| path == expected.as_path())
                .times(1)
                .returning(|_| Ok(true));

            let engine = RedirectEngine::new(mock, KernelRegistry::with_root(Some(f.kernel)));
            engine.redirect(&f.app).unwrap();
            let report = engine.restore(&f.app).unwrap();

            assert_eq!(report.restored.len(), 3);
            assert!(!is_symlink(&f.app.path.join("chrome.dll")));
            assert_eq!(redirection_state(&f.app.path), RedirectionState::Unredirected);
        }

        #[test]
        fn test_app_cannot_be_its_own_kernel() {
            let f = fixture(&["chrome.dll"]);
            let engine = RedirectEngine::new(
                MockAppRegistry::new(),
                KernelRegistry::with_root(Some(f.app.path.clone())),
            );

            assert!(matches!(
                engine.redirect(&f.app),
                Err(RedirectError::AppIsKernel(_))
            ));
            assert!(!backup_dir(&f.app.path).exists());
        }

        #[test]
        fn test_state_with_missing_backed_up_file_is_partial() {
            let f = fixture(&["chrome.dll"]);
            let backup = backup_dir(&f.app.path);
            fs::create_dir(&backup).unwrap();
            fs::write(backup.join("chrome.dll"), b"own").unwrap();
            fs::write(backup.join("icudtl.dat"), b"own").unwrap();

            assert_eq!(
                redirection_state(&f.app.path),
                RedirectionState::PartiallyRedirected
            );
        }
    }

    proptest! {
        #[test]
        fn prop_accept_iff_any_link(linked in proptest::collection::vec(any::<bool>(), 0..12)) {
            let outcomes: Vec<LinkOutcome> = linked
                .iter()
                .enumerate()
                .map(|(i, ok)| if *ok {
                    LinkOutcome::Linked(format!("f{}", i))
                } else {
                    LinkOutcome::Failed(failure(&format!("f{}", i), FailureKind::Io))
                })
                .collect();

            let expected = if linked.contains(&true) {
                RedirectDecision::Accept
            } else {
                RedirectDecision::RollBack
            };
            prop_assert_eq!(decide_outcome(&outcomes), expected);
        }
    }
}
