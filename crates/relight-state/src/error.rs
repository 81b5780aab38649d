//! Errors surfaced at the router boundary.

use std::sync::Arc;
use std::time::Duration;

use relight_control::ControlError;
use thiserror::Error;

/// Result type alias for state manager operations.
pub type StateResult<T> = Result<T, StateError>;

/// Why a key could not be resolved to a running VM.
///
/// `Clone` so that every waiter of a coalesced wake receives the same error.
#[derive(Debug, Clone, Error)]
pub enum StateError {
    /// No VM matches the key. Cached; never retried within the process.
    #[error("app {key:?}: not found")]
    NotFound { key: String },

    /// The describe call failed. Nothing was cached.
    #[error("app {key:?}: control plane lookup failed: {source}")]
    Transport {
        key: String,
        source: Arc<ControlError>,
    },

    /// The resume call failed. The record is back to `Paused`.
    #[error("app {key:?}: wake failed: {source}")]
    WakeFailed {
        key: String,
        source: Arc<ControlError>,
    },

    /// This caller stopped waiting; the wake itself may still succeed.
    #[error("app {key:?}: wake timed out after {timeout:?}")]
    WakeTimeout { key: String, timeout: Duration },

    /// The caller was cancelled while waiting.
    #[error("app {key:?}: cancelled while waiting for wake")]
    Cancelled { key: String },
}

impl StateError {
    /// Routing key the failed operation was for.
    pub fn key(&self) -> &str {
        match self {
            Self::NotFound { key }
            | Self::Transport { key, .. }
            | Self::WakeFailed { key, .. }
            | Self::WakeTimeout { key, .. }
            | Self::Cancelled { key } => key,
        }
    }

    /// True for [`StateError::NotFound`], the one error a proxy maps to 404.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether a later request for the same key may succeed.
    pub fn is_retryable(&self) -> bool {
        !self.is_not_found()
    }
}
