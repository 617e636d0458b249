//! Services module - detection and redirection logic.
//!
//! Everything here is blocking filesystem work with no dependency on the
//! binary. Callers that need responsiveness run it on a blocking thread.
//!
//! # Components
//!
//! - [`classifier`]: marker-file test for Chromium application roots and
//!   version extraction from the kernel DLL.
//! - [`walker`]: lazy, cancellable directory walk producing [`ScanEvent`]s.
//! - [`kernel`]: the shared kernel location and the [`KernelManifest`] of
//!   redirectable file names.
//! - [`redirect`]: the [`RedirectEngine`], which backs up kernel files,
//!   swaps them for links into the shared kernel and reverses it.
//!
//! # Usage Example
//!
//! ```ignore
//! use chromiumto::config::ConfigManager;
//! use chromiumto::services::RedirectEngine;
//!
//! let engine = RedirectEngine::from_registry(ConfigManager::new(data_dir)?)?;
//! let document = engine.registry().load()?;
//! let batch = engine.redirect_all(&document.detected_apps);
//! println!("{} redirected, {} failed", batch.success_count, batch.fail_count);
//! ```

pub mod classifier;
pub mod kernel;
pub mod redirect;
pub mod walker;

pub use kernel::{KernelManifest, KernelRegistry, KernelSupplier, LocalDirectorySupplier};
pub use redirect::{
    BatchReport, BackupInfo, ErrorClass, FileOps, LocalFileOps, RedirectEngine, RedirectError,
    RedirectReport, ReconcileReport, RestoreReport,
};
pub use walker::{DirectoryWalker, ScanEvent, ScanPolicy};
