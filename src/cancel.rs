// Cooperative cancellation for long-running scans
//
// The walker polls the token between directory visits; nothing is interrupted
// mid-file.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared cancellation flag.
///
/// Clones share state: cancelling any clone is observed by all of them.
///
/// # Example
/// ```
/// use chromiumto::cancel::CancellationToken;
///
/// let token = CancellationToken::new();
/// let walker_side = token.clone();
///
/// token.cancel();
/// assert!(walker_side.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
