//! relight-watcher: scale-to-zero side of relight.
//!
//! The [`IdleWatcher`] owns one background task that wakes every
//! `interval`, asks the state manager for VMs idle longer than
//! `idle_timeout`, and pauses them through the control plane.
//!
//! # Architecture
//!
//! ```text
//! IdleWatcher
//!   └── background loop (interval ticker + shutdown watch)
//!       └── per-tick task (panics are caught and logged)
//!           ├── VmStateManager::idle_keys()
//!           ├── ControlPlane::pause(hostname)
//!           └── VmStateManager::mark_paused()
//! ```
//!
//! A failed pause is logged and skipped; the other idle VMs in the same
//! tick are still paused.

pub mod watcher;

pub use watcher::{IdleWatcher, TickStats, WatchConfig};
