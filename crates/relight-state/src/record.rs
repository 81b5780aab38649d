//! Cached knowledge about one routable key.

use std::fmt;
use std::sync::Arc;

use relight_control::{ControlError, NodeInfo, RemoteStatus};
use tokio::time::Instant;

use crate::wake::{WakeSignal, WakeWaiter};

/// Lifecycle of the VM behind a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// The control plane reported a status other than running or paused.
    Unknown,
    Running,
    Paused,
    /// A resume call is in flight.
    Waking,
    /// No VM matches the key. Terminal.
    NotFound,
}

impl LifecycleState {
    /// Lowercase name used in logs and the `Display` impl.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Waking => "waking",
            Self::NotFound => "not_found",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<RemoteStatus> for LifecycleState {
    fn from(status: RemoteStatus) -> Self {
        match status {
            RemoteStatus::Running => Self::Running,
            RemoteStatus::Paused => Self::Paused,
            RemoteStatus::Other => Self::Unknown,
        }
    }
}

/// Point-in-time copy of a record, handed out to callers.
#[derive(Debug, Clone)]
pub struct InstanceRecord {
    pub key: String,
    /// Control plane handle (VM hostname). Empty for `NotFound`.
    pub instance: String,
    /// VM address. Empty for `NotFound`.
    pub address: String,
    pub state: LifecycleState,
    /// Last routed request. Only meaningful while `Running`.
    pub last_activity: Instant,
    /// Error of the most recent failed wake, until the next wake begins.
    pub wake_error: Option<String>,
}

/// The mutable record behind the manager's lock.
#[derive(Debug)]
pub(crate) struct VmEntry {
    pub(crate) key: String,
    pub(crate) instance: String,
    pub(crate) address: String,
    pub(crate) state: LifecycleState,
    pub(crate) last_activity: Instant,
    /// Present iff `state == Waking`.
    pub(crate) wake: Option<WakeSignal>,
    pub(crate) wake_error: Option<Arc<ControlError>>,
}

impl VmEntry {
    pub(crate) fn not_found(key: &str) -> Self {
        Self {
            key: key.to_string(),
            instance: String::new(),
            address: String::new(),
            state: LifecycleState::NotFound,
            last_activity: Instant::now(),
            wake: None,
            wake_error: None,
        }
    }

    pub(crate) fn from_node(key: &str, node: &NodeInfo) -> Self {
        Self {
            key: key.to_string(),
            instance: node.hostname.clone(),
            address: node.address.clone(),
            state: node.remote_status().into(),
            last_activity: Instant::now(),
            wake: None,
            wake_error: None,
        }
    }

    pub(crate) fn snapshot(&self) -> InstanceRecord {
        InstanceRecord {
            key: self.key.clone(),
            instance: self.instance.clone(),
            address: self.address.clone(),
            state: self.state,
            last_activity: self.last_activity,
            wake_error: self.wake_error.as_ref().map(|e| e.to_string()),
        }
    }

    /// Enter `Waking` with a fresh signal and return the first waiter.
    pub(crate) fn begin_wake(&mut self) -> WakeWaiter {
        let signal = WakeSignal::new();
        let waiter = signal.subscribe();
        self.state = LifecycleState::Waking;
        self.wake = Some(signal);
        self.wake_error = None;
        waiter
    }

    /// Leave `Waking`, returning the signal to fire. `None` if not waking.
    pub(crate) fn end_wake(&mut self, result: Result<(), Arc<ControlError>>) -> Option<WakeSignal> {
        if self.state != LifecycleState::Waking {
            return None;
        }
        let signal = self.wake.take()?;
        match result {
            Ok(()) => {
                self.state = LifecycleState::Running;
                self.wake_error = None;
            }
            Err(e) => {
                self.state = LifecycleState::Paused;
                self.wake_error = Some(e);
            }
        }
        Some(signal)
    }
}
