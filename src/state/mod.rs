// State management module
//
// StateManager owns the scan session: it wraps AppState in Arc<RwLock<T>>,
// allows one active scan at a time, and broadcasts change events to observers.

use crate::cancel::CancellationToken;
use crate::config::AppRegistry;
use crate::metrics::Metrics;
use crate::models::{AppRecord, AppState, ExclusionSet};
use crate::services::walker::{DirectoryWalker, ScanEvent, ScanPolicy};
use camino::Utf8PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tokio::sync::broadcast;

/// Change events emitted when state is modified
///
/// Observers (the binary's progress printer, tests) subscribe instead of
/// polling the state.
#[derive(Clone, Debug, PartialEq)]
pub enum StateChange {
    /// A scan has started
    ScanStarted { policy: ScanPolicy },

    /// Progress has been updated during a scan
    ProgressUpdated {
        scanned: u64,
        total: u64,
        current_path: Option<Utf8PathBuf>,
    },

    /// An application was detected
    AppFound { app: AppRecord },

    /// The scan has finished, normally or by cancellation, with every app it found
    ScanComplete {
        apps: Vec<AppRecord>,
        cancelled: bool,
    },

    /// A scan was requested while another was running
    ScanRejected,
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("A scan is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Registry(#[from] anyhow::Error),
}

/// Thread-safe scan session owner with event emission
///
/// - Provides thread-safe access to [`AppState`] via `Arc<RwLock<T>>`
/// - Detects state changes and emits [`StateChange`] events
/// - Rejects a scan request while another scan is active
/// - Holds the [`CancellationToken`] of the active scan
///
/// Clones share the same state, channel and active scan.
pub struct StateManager {
    /// The scan state protected by RwLock for thread-safe access
    state: Arc<RwLock<AppState>>,

    /// Broadcast channel for emitting state change events
    state_tx: broadcast::Sender<StateChange>,

    /// Token of the running scan, if any
    active_scan: Arc<Mutex<Option<CancellationToken>>>,

    metrics: Arc<Metrics>,
}

impl StateManager {
    /// Create a new StateManager with default state
    ///
    /// The broadcast channel buffers 100 events; slow subscribers may lag.
    pub fn new() -> Self {
        let (state_tx, _) = broadcast::channel(100);
        Self {
            state: Arc::new(RwLock::new(AppState::default())),
            state_tx,
            active_scan: Arc::new(Mutex::new(None)),
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Get a read-only snapshot of the current state
    pub fn snapshot(&self) -> AppState {
        self.state.read().unwrap().clone()
    }

    /// Execute a function with read access to the state
    ///
    /// # Example
    /// ```ignore
    /// let ratio = state_manager.read(|state| state.progress_ratio());
    /// ```
    pub fn read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&AppState) -> R,
    {
        let state = self.state.read().unwrap();
        f(&state)
    }

    /// Update the state and emit change events
    ///
    /// Captures the old state, applies `update_fn`, then emits one event per
    /// detected change. Returns the emitted events.
    pub fn update<F>(&self, update_fn: F) -> Vec<StateChange>
    where
        F: FnOnce(&mut AppState),
    {
        let mut state = self.state.write().unwrap();
        let old_state = state.clone();

        update_fn(&mut state);

        let changes = self.detect_changes(&old_state, &state);
        for change in &changes {
            self.emit(change.clone());
        }

        changes
    }

    /// Subscribe to state change events
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.state_tx.subscribe()
    }

    fn emit(&self, change: StateChange) {
        // No subscribers is fine
        let _ = self.state_tx.send(change);
    }

    /// Events for the difference between two states, in a fixed order:
    /// start, found apps, progress, completion.
    fn detect_changes(&self, old: &AppState, new: &AppState) -> Vec<StateChange> {
        let mut changes = Vec::new();

        if !old.is_scanning && new.is_scanning {
            if let Some(policy) = new.scan_policy {
                changes.push(StateChange::ScanStarted { policy });
            }
        }

        if new.detected_apps.len() > old.detected_apps.len() {
            for app in &new.detected_apps[old.detected_apps.len()..] {
                changes.push(StateChange::AppFound { app: app.clone() });
            }
        }

        if old.scanned != new.scanned
            || old.total != new.total
            || old.current_path != new.current_path
        {
            changes.push(StateChange::ProgressUpdated {
                scanned: new.scanned,
                total: new.total,
                current_path: new.current_path.clone(),
            });
        }

        if old.is_scanning && !new.is_scanning {
            changes.push(StateChange::ScanComplete {
                apps: new.detected_apps.clone(),
                cancelled: new.last_scan_cancelled,
            });
        }

        changes
    }

    /// Claim the scan slot.
    ///
    /// Returns the token for the new scan, or [`ScanError::AlreadyRunning`]
    /// (and a [`StateChange::ScanRejected`] event) if a scan is active.
    pub fn begin_scan(&self, policy: ScanPolicy) -> Result<CancellationToken, ScanError> {
        let mut active = self.active_scan.lock().unwrap();
        if active.is_some() {
            tracing::warn!("Scan request rejected: a scan is already running");
            self.emit(StateChange::ScanRejected);
            return Err(ScanError::AlreadyRunning);
        }

        let token = CancellationToken::new();
        *active = Some(token.clone());

        self.update(|state| {
            state.reset_scan_state();
            state.is_scanning = true;
            state.scan_policy = Some(policy);
        });
        tracing::info!("{:?} scan started", policy);
        Ok(token)
    }

    /// Request cancellation of the active scan. Returns false if none is running.
    pub fn stop_scan(&self) -> bool {
        match self.active_scan.lock().unwrap().as_ref() {
            Some(token) => {
                tracing::info!("Scan cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.active_scan.lock().unwrap().is_some()
    }

    /// Fold one walker event into the state.
    pub fn record_event(&self, event: ScanEvent) -> Vec<StateChange> {
        self.update(|state| match event {
            ScanEvent::Progress {
                scanned,
                total,
                current_path,
            } => {
                state.scanned = scanned;
                state.total = total;
                state.current_path = Some(current_path);
            }
            ScanEvent::AppFound(app) => state.detected_apps.push(app),
        })
    }

    /// Release the scan slot.
    pub fn finish_scan(&self, cancelled: bool) -> Vec<StateChange> {
        let changes = self.update(|state| {
            state.is_scanning = false;
            state.current_path = None;
            state.last_scan_cancelled = cancelled;
        });
        *self.active_scan.lock().unwrap() = None;

        let state = self.snapshot();
        tracing::info!(
            "Scan {}: {} apps, {} files",
            if cancelled { "cancelled" } else { "complete" },
            state.detected_apps.len(),
            state.scanned
        );
        changes
    }

    /// Scan with the roots and exclusions of `policy`, persisting each app found.
    ///
    /// The shared kernel, when set, is excluded so it is never reported as an app.
    pub fn run_scan(
        &self,
        policy: ScanPolicy,
        registry: &dyn AppRegistry,
    ) -> Result<Vec<AppRecord>, ScanError> {
        let document = registry.load()?;
        let mut exclusions = policy.exclusions(&document.scan_exclusions);
        if let Some(kernel) = &document.shared_kernel_path {
            exclusions.insert(kernel.as_str());
        }

        self.run_walk(policy, policy.roots(), exclusions, registry)
    }

    /// Walk explicit roots, persisting each app found.
    ///
    /// A full scan replaces the detected list; a quick scan adds to it.
    pub fn run_walk(
        &self,
        policy: ScanPolicy,
        roots: Vec<Utf8PathBuf>,
        exclusions: ExclusionSet,
        registry: &dyn AppRegistry,
    ) -> Result<Vec<AppRecord>, ScanError> {
        let token = self.begin_scan(policy)?;

        if policy == ScanPolicy::Full {
            if let Err(e) = registry.clear_detected_apps() {
                tracing::warn!("Failed to clear detected apps: {:#}", e);
            }
        }

        let walker = DirectoryWalker::new(roots, exclusions, token.clone());
        for event in walker {
            match &event {
                ScanEvent::AppFound(app) => {
                    self.metrics.record_app_detected();
                    if let Err(e) = registry.add_detected_app(app) {
                        tracing::warn!("Failed to persist {}: {:#}", app.path, e);
                    }
                }
                ScanEvent::Progress { .. } => self.metrics.record_directory_scanned(),
            }
            self.record_event(event);
        }

        self.finish_scan(token.is_cancelled());
        Ok(self.read(|state| state.detected_apps.clone()))
    }

    /// Get an Arc reference to the state for use in worker threads
    pub fn state_arc(&self) -> Arc<RwLock<AppState>> {
        Arc::clone(&self.state)
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

// Make StateManager cloneable for sharing across threads
impl Clone for StateManager {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            state_tx: self.state_tx.clone(),
            active_scan: Arc::clone(&self.active_scan),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryRegistry;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_new_state_manager() {
        let manager = StateManager::new();
        let state = manager.snapshot();

        assert!(!state.is_scanning);
        assert!(!manager.is_scanning());
        assert_eq!(state.scanned, 0);
    }

    #[test]
    fn test_begin_scan_emits_started() {
        let manager = StateManager::new();
        let mut rx = manager.subscribe();

        manager.begin_scan(ScanPolicy::Quick).unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            StateChange::ScanStarted {
                policy: ScanPolicy::Quick
            }
        );
        assert!(manager.is_scanning());
    }

    #[test]
    fn test_second_scan_is_rejected() {
        let manager = StateManager::new();
        let token = manager.begin_scan(ScanPolicy::Full).unwrap();
        let mut rx = manager.subscribe();

        assert!(matches!(
            manager.begin_scan(ScanPolicy::Quick),
            Err(ScanError::AlreadyRunning)
        ));
        assert_eq!(rx.try_recv().unwrap(), StateChange::ScanRejected);
        assert!(!token.is_cancelled());
        assert_eq!(manager.snapshot().scan_policy, Some(ScanPolicy::Full));
    }

    #[test]
    fn test_stop_scan_cancels_token() {
        let manager = StateManager::new();
        assert!(!manager.stop_scan());

        let token = manager.begin_scan(ScanPolicy::Quick).unwrap();
        assert!(manager.stop_scan());
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_finish_releases_slot() {
        let manager = StateManager::new();
        manager.begin_scan(ScanPolicy::Quick).unwrap();

        let changes = manager.finish_scan(true);
        assert_eq!(
            changes.last(),
            Some(&StateChange::ScanComplete {
                apps: Vec::new(),
                cancelled: true
            })
        );
        assert!(manager.begin_scan(ScanPolicy::Quick).is_ok());
    }

    #[test]
    fn test_record_event_orders_app_before_progress() {
        let manager = StateManager::new();
        manager.begin_scan(ScanPolicy::Quick).unwrap();

        let app = AppRecord::new("/apps/Slack", "unknown", 0);
        let changes = manager.record_event(ScanEvent::AppFound(app.clone()));
        assert_eq!(changes, vec![StateChange::AppFound { app }]);

        let changes = manager.record_event(ScanEvent::Progress {
            scanned: 3,
            total: 10,
            current_path: Utf8PathBuf::from("/apps/Slack"),
        });
        assert!(matches!(
            changes[0],
            StateChange::ProgressUpdated {
                scanned: 3,
                total: 10,
                ..
            }
        ));
    }

    #[test]
    fn test_run_walk_persists_found_apps() {
        let temp = TempDir::new().unwrap();
        let root = Utf8PathBuf::try_from(temp.path().to_path_buf()).unwrap();
        fs::create_dir_all(root.join("Discord")).unwrap();
        fs::write(root.join("Discord").join("chrome_elf.dll"), b"x").unwrap();

        let registry = MemoryRegistry::new();
        let manager = StateManager::new();
        let apps = manager
            .run_walk(ScanPolicy::Quick, vec![root.clone()], ExclusionSet::new(), &registry)
            .unwrap();

        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].name, "Discord");
        assert_eq!(registry.load().unwrap().detected_apps.len(), 1);
        assert!(!manager.is_scanning());
    }
}
