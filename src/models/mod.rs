//! Data models for ChromiumTo.
//!
//! - [`AppRecord`]: a detected application, keyed by install path
//! - [`RedirectionState`]: derived redirect status of an application
//! - [`AppDocument`]: the persisted document (kernel path, app lists, exclusions)
//! - [`ExclusionSet`]: ordered substring patterns that keep subtrees out of a scan
//! - [`AppState`]: scan-session state held by [`StateManager`](crate::state::StateManager)

pub mod app;
pub mod app_state;
pub mod config;

pub use app::{AppRecord, RedirectionState};
pub use app_state::AppState;
pub use config::{AppDocument, ExclusionSet, PROTECTED_EXCLUSIONS};
