use crate::models::AppRecord;
use crate::services::walker::ScanPolicy;
use camino::Utf8PathBuf;

/// Scan-session state shared between the scanning thread and observers.
///
/// Wrapped in `Arc<RwLock<AppState>>` by [`crate::state::StateManager`]; never
/// mutate it directly, go through
/// [`update()`](crate::state::StateManager::update) so that change events are
/// emitted.
#[derive(Clone, Debug, Default)]
pub struct AppState {
    // Runtime state
    pub is_scanning: bool,
    pub scan_policy: Option<ScanPolicy>,
    pub current_path: Option<Utf8PathBuf>,

    // Progress state
    pub scanned: u64,
    pub total: u64,

    // Results
    pub detected_apps: Vec<AppRecord>,
    pub last_scan_cancelled: bool,
}

impl AppState {
    /// Fraction of the estimated total scanned so far, clamped to 1.0.
    ///
    /// The estimate comes from a pre-pass and may drift if the tree changes
    /// during the scan.
    pub fn progress_ratio(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.scanned as f64 / self.total as f64).min(1.0)
    }

    /// Clear progress and results before a new scan.
    pub fn reset_scan_state(&mut self) {
        self.current_path = None;
        self.scanned = 0;
        self.total = 0;
        self.detected_apps.clear();
        self.last_scan_cancelled = false;
    }
}
