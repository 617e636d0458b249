// Operation metrics
//
// Lightweight counters for scans and redirects. Byte totals are best-effort
// telemetry, not a disk-usage report.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Process-wide operation counters.
///
/// Uses atomic operations so the scanning thread and the caller can both
/// record without locks. Logged on shutdown by the binary.
#[derive(Debug)]
pub struct Metrics {
    /// Directories visited by scans
    pub directories_scanned: AtomicU64,

    /// Applications reported by scans
    pub apps_detected: AtomicUsize,

    /// Applications accepted as redirected
    pub apps_redirected: AtomicUsize,

    /// Redirects that were rejected or rolled back
    pub redirects_failed: AtomicUsize,

    /// Applications restored to their own kernel
    pub apps_restored: AtomicUsize,

    /// Restores that failed or stopped part way
    pub restores_failed: AtomicUsize,

    /// Kernel files replaced by links
    pub files_linked: AtomicU64,

    /// Bytes of kernel files now served by the shared copy
    pub bytes_shared: AtomicU64,

    /// Application start time
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            directories_scanned: AtomicU64::new(0),
            apps_detected: AtomicUsize::new(0),
            apps_redirected: AtomicUsize::new(0),
            redirects_failed: AtomicUsize::new(0),
            apps_restored: AtomicUsize::new(0),
            restores_failed: AtomicUsize::new(0),
            files_linked: AtomicU64::new(0),
            bytes_shared: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_directory_scanned(&self) {
        self.directories_scanned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_app_detected(&self) {
        self.apps_detected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an accepted redirect with its linked file count and byte total
    pub fn record_app_redirected(&self, files: u64, bytes: u64) {
        self.apps_redirected.fetch_add(1, Ordering::Relaxed);
        self.files_linked.fetch_add(files, Ordering::Relaxed);
        self.bytes_shared.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_redirect_failed(&self) {
        self.redirects_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_app_restored(&self) {
        self.apps_restored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_restore_failed(&self) {
        self.restores_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Get total uptime
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Log metrics summary
    pub fn log_summary(&self) {
        tracing::info!("=== Operation Metrics Summary ===");
        tracing::info!("Uptime: {:.2}s", self.uptime().as_secs_f64());
        tracing::info!(
            "Scan: {} directories, {} apps detected",
            self.directories_scanned.load(Ordering::Relaxed),
            self.apps_detected.load(Ordering::Relaxed)
        );
        tracing::info!(
            "Redirect: {} succeeded, {} failed, {} files linked, {} bytes shared",
            self.apps_redirected.load(Ordering::Relaxed),
            self.redirects_failed.load(Ordering::Relaxed),
            self.files_linked.load(Ordering::Relaxed),
            self.bytes_shared.load(Ordering::Relaxed)
        );
        tracing::info!(
            "Restore: {} succeeded, {} failed",
            self.apps_restored.load(Ordering::Relaxed),
            self.restores_failed.load(Ordering::Relaxed)
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
