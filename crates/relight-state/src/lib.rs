//! relight-state: per-key VM state for scale-to-zero routing.
//!
//! The [`VmStateManager`] maps a routing key (hostname or app tag) to the
//! VM that serves it, resumes paused VMs on demand and tracks activity so
//! the idle watcher can pause them again.
//!
//! # State machine
//!
//! ```text
//! Unknown/Paused --initiate wake--> Waking --resume ok----> Running
//!                                   Waking --resume failed--> Paused
//! Running  --idle pause confirmed--> Paused
//! NotFound (terminal)
//! ```
//!
//! # Concurrency
//!
//! A single mutex guards the key → record map. No network call is made
//! while it is held. Concurrent wakers of one key share a single resume
//! call through a one-shot [`watch`](tokio::sync::watch) signal created
//! together with the `Waking` transition.

pub mod error;
pub mod manager;
pub mod record;
mod wake;

pub use error::{StateError, StateResult};
pub use manager::VmStateManager;
pub use record::{InstanceRecord, LifecycleState};
