// ChromiumTo - shared Chromium kernel for Electron and CEF applications
//
// This is the library crate containing detection, redirection and persistence.
// The binary crate (main.rs) provides the command-line entry point.

pub mod cancel;
pub mod config;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod services;
pub mod state;

// Re-export commonly used types for convenience
pub use cancel::CancellationToken;
pub use config::{AppRegistry, ConfigManager, MemoryRegistry, Settings};
pub use metrics::Metrics;
pub use models::{AppDocument, AppRecord, AppState, ExclusionSet, RedirectionState};
pub use services::{RedirectEngine, RedirectError, ScanEvent, ScanPolicy};
pub use state::{ScanError, StateChange, StateManager};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
