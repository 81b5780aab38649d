//! In-memory control plane.
//!
//! Holds a fixed set of VMs and flips their status on resume/pause. Every
//! call is counted, and latency or failures can be injected per hostname,
//! which makes it the test double for the state manager and idle watcher.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tracing::debug;

use crate::error::{ControlError, ControlResult};
use crate::types::{NodeInfo, RemoteStatus};
use crate::{BoxFuture, ControlPlane};

#[derive(Default)]
struct Faults {
    describe: bool,
    resume: HashSet<String>,
    pause: HashSet<String>,
}

/// A control plane backed by a `Vec<NodeInfo>`.
#[derive(Default)]
pub struct MemoryControlPlane {
    nodes: Mutex<Vec<NodeInfo>>,
    faults: Mutex<Faults>,
    describe_delay: Mutex<Duration>,
    resume_delay: Mutex<Duration>,
    pause_delay: Mutex<Duration>,
    describe_calls: AtomicUsize,
    resume_calls: AtomicUsize,
    pause_calls: AtomicUsize,
}

impl MemoryControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: add a VM.
    pub fn with_node(self, node: NodeInfo) -> Self {
        self.add_node(node);
        self
    }

    pub fn add_node(&self, node: NodeInfo) {
        self.nodes.lock().expect("nodes lock").push(node);
    }

    /// Delay applied to every `describe` call.
    pub fn set_describe_delay(&self, delay: Duration) {
        *self.describe_delay.lock().expect("delay lock") = delay;
    }

    /// Delay applied to every `resume` call before it completes.
    pub fn set_resume_delay(&self, delay: Duration) {
        *self.resume_delay.lock().expect("delay lock") = delay;
    }

    /// Delay applied to every `pause` call before it completes.
    pub fn set_pause_delay(&self, delay: Duration) {
        *self.pause_delay.lock().expect("delay lock") = delay;
    }

    pub fn fail_describe(&self, fail: bool) {
        self.faults.lock().expect("faults lock").describe = fail;
    }

    /// Make `resume(hostname)` fail until cleared.
    pub fn fail_resume(&self, hostname: &str, fail: bool) {
        let mut faults = self.faults.lock().expect("faults lock");
        if fail {
            faults.resume.insert(hostname.to_string());
        } else {
            faults.resume.remove(hostname);
        }
    }

    /// Make `pause(hostname)` fail until cleared.
    pub fn fail_pause(&self, hostname: &str, fail: bool) {
        let mut faults = self.faults.lock().expect("faults lock");
        if fail {
            faults.pause.insert(hostname.to_string());
        } else {
            faults.pause.remove(hostname);
        }
    }

    pub fn describe_calls(&self) -> usize {
        self.describe_calls.load(Ordering::SeqCst)
    }

    pub fn resume_calls(&self) -> usize {
        self.resume_calls.load(Ordering::SeqCst)
    }

    pub fn pause_calls(&self) -> usize {
        self.pause_calls.load(Ordering::SeqCst)
    }

    /// Current status of a VM, if it exists.
    pub fn status_of(&self, hostname: &str) -> Option<RemoteStatus> {
        self.nodes
            .lock()
            .expect("nodes lock")
            .iter()
            .find(|n| n.hostname == hostname)
            .map(NodeInfo::remote_status)
    }

    fn set_status(&self, hostname: &str, status: RemoteStatus) -> ControlResult<()> {
        let mut nodes = self.nodes.lock().expect("nodes lock");
        let node = nodes
            .iter_mut()
            .find(|n| n.hostname == hostname)
            .ok_or_else(|| ControlError::Status {
                status: 404,
                body: format!("vm {hostname} not found"),
            })?;
        node.status = status.as_str().to_string();
        Ok(())
    }
}

impl ControlPlane for MemoryControlPlane {
    fn describe<'a>(&'a self, key: &'a str) -> BoxFuture<'a, ControlResult<Vec<NodeInfo>>> {
        Box::pin(async move {
            self.describe_calls.fetch_add(1, Ordering::SeqCst);
            let delay = *self.describe_delay.lock().expect("delay lock");
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if self.faults.lock().expect("faults lock").describe {
                return Err(ControlError::Remote("describe failed".to_string()));
            }
            let nodes = self.nodes.lock().expect("nodes lock");
            Ok(nodes.iter().filter(|n| n.matches(key)).cloned().collect())
        })
    }

    fn resume<'a>(&'a self, hostname: &'a str) -> BoxFuture<'a, ControlResult<()>> {
        Box::pin(async move {
            self.resume_calls.fetch_add(1, Ordering::SeqCst);
            debug!(%hostname, "memory control plane: resume");
            let delay = *self.resume_delay.lock().expect("delay lock");
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if self.faults.lock().expect("faults lock").resume.contains(hostname) {
                return Err(ControlError::Remote(format!("resume {hostname} failed")));
            }
            self.set_status(hostname, RemoteStatus::Running)
        })
    }

    fn pause<'a>(&'a self, hostname: &'a str) -> BoxFuture<'a, ControlResult<()>> {
        Box::pin(async move {
            self.pause_calls.fetch_add(1, Ordering::SeqCst);
            debug!(%hostname, "memory control plane: pause");
            let delay = *self.pause_delay.lock().expect("delay lock");
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if self.faults.lock().expect("faults lock").pause.contains(hostname) {
                return Err(ControlError::Remote(format!("pause {hostname} failed")));
            }
            self.set_status(hostname, RemoteStatus::Paused)
        })
    }
}
