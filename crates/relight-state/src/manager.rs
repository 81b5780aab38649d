//! VM state manager: lookup with populate-on-miss, coalesced wake and
//! idle bookkeeping.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use relight_control::{ControlError, ControlPlane};

use crate::error::{StateError, StateResult};
use crate::record::{InstanceRecord, LifecycleState, VmEntry};
use crate::wake::WakeWaiter;

/// Upper bound on a single resume call. Exceeding it fails the wake.
pub const DEFAULT_RESUME_DEADLINE: Duration = Duration::from_secs(30);

struct Inner {
    records: Mutex<HashMap<String, VmEntry>>,
    control: Arc<dyn ControlPlane>,
    resume_deadline: Duration,
}

/// Caches per-key VM state and coordinates wakes.
///
/// Cheap to clone; clones share the same records. Records are never
/// removed while the process runs, so a `NotFound` answer is sticky.
#[derive(Clone)]
pub struct VmStateManager {
    inner: Arc<Inner>,
}

impl VmStateManager {
    pub fn new(control: Arc<dyn ControlPlane>) -> Self {
        Self::with_resume_deadline(control, DEFAULT_RESUME_DEADLINE)
    }

    /// Create a manager with a custom resume deadline.
    pub fn with_resume_deadline(control: Arc<dyn ControlPlane>, deadline: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                records: Mutex::new(HashMap::new()),
                control,
                resume_deadline: deadline,
            }),
        }
    }

    // Critical sections never panic mid-update, so a poisoned lock still
    // guards consistent records.
    fn records(&self) -> MutexGuard<'_, HashMap<String, VmEntry>> {
        self.inner
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the record for `key`, asking the control plane on first sight.
    ///
    /// Cached records (including `NotFound`) are returned without a network
    /// call. A failed describe is not cached.
    pub async fn lookup(&self, key: &str) -> StateResult<InstanceRecord> {
        let cached = self.records().get(key).map(VmEntry::snapshot);
        if let Some(record) = cached {
            debug!(%key, state = %record.state, "state cache hit");
            return Ok(record);
        }

        let nodes = self
            .inner
            .control
            .describe(key)
            .await
            .map_err(|e| StateError::Transport {
                key: key.to_string(),
                source: Arc::new(e),
            })?;

        let mut records = self.records();

        // First writer wins if a concurrent lookup got here first.
        if let Some(existing) = records.get(key) {
            return Ok(existing.snapshot());
        }

        let entry = match nodes.first() {
            Some(node) => {
                if nodes.len() > 1 {
                    warn!(%key, count = nodes.len(), "multiple VMs match key, using the first");
                }
                VmEntry::from_node(key, node)
            }
            None => VmEntry::not_found(key),
        };
        info!(
            %key,
            hostname = %entry.instance,
            address = %entry.address,
            state = %entry.state,
            "discovered VM"
        );

        let record = entry.snapshot();
        records.insert(key.to_string(), entry);
        Ok(record)
    }

    /// Make sure the VM for `key` is running and return its address.
    ///
    /// Equivalent to [`ensure_running_until`](Self::ensure_running_until)
    /// with a cancellation that never fires. Dropping the returned future
    /// is also a valid way to stop waiting.
    pub async fn ensure_running(&self, key: &str, timeout: Duration) -> StateResult<String> {
        self.ensure_running_until(key, timeout, std::future::pending())
            .await
    }

    /// Make sure the VM for `key` is running and return its address.
    ///
    /// A paused VM is resumed; concurrent callers for the same key share a
    /// single resume call and all observe the same outcome. The caller
    /// stops waiting when the wake completes, `timeout` elapses or
    /// `cancelled` resolves. Neither of the latter two affects the resume
    /// itself.
    pub async fn ensure_running_until<F>(
        &self,
        key: &str,
        timeout: Duration,
        cancelled: F,
    ) -> StateResult<String>
    where
        F: Future<Output = ()>,
    {
        self.lookup(key).await?;

        let (waiter, hostname) = {
            let mut records = self.records();
            let entry = records.get_mut(key).ok_or_else(|| StateError::NotFound {
                key: key.to_string(),
            })?;

            match entry.state {
                LifecycleState::NotFound => {
                    return Err(StateError::NotFound {
                        key: key.to_string(),
                    });
                }
                LifecycleState::Running => return Ok(entry.address.clone()),
                LifecycleState::Waking | LifecycleState::Paused | LifecycleState::Unknown => {
                    match entry.wake.as_ref().map(|signal| signal.subscribe()) {
                        Some(waiter) => {
                            debug!(%key, "joining in-flight wake");
                            (waiter, None)
                        }
                        None => (entry.begin_wake(), Some(entry.instance.clone())),
                    }
                }
            }
        };

        if let Some(hostname) = hostname {
            info!(%key, %hostname, "waking VM");
            self.spawn_wake(key, hostname);
        }

        self.wait_for_wake(key, waiter, timeout, cancelled).await
    }

    async fn wait_for_wake<F>(
        &self,
        key: &str,
        waiter: WakeWaiter,
        timeout: Duration,
        cancelled: F,
    ) -> StateResult<String>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            biased;

            outcome = waiter.wait() => outcome.map_err(|source| StateError::WakeFailed {
                key: key.to_string(),
                source,
            }),
            _ = tokio::time::sleep(timeout) => {
                warn!(%key, ?timeout, "gave up waiting for wake");
                Err(StateError::WakeTimeout {
                    key: key.to_string(),
                    timeout,
                })
            }
            _ = cancelled => Err(StateError::Cancelled {
                key: key.to_string(),
            }),
        }
    }

    /// Run the resume call on its own task so no waiter owns it.
    fn spawn_wake(&self, key: &str, hostname: String) {
        let control = Arc::clone(&self.inner.control);
        let deadline = self.inner.resume_deadline;
        let resume = tokio::spawn(async move {
            match tokio::time::timeout(deadline, control.resume(&hostname)).await {
                Ok(result) => result,
                Err(_) => Err(ControlError::Timeout(deadline)),
            }
        });

        let manager = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            let result = match resume.await {
                Ok(result) => result,
                Err(join_err) => Err(ControlError::Remote(format!(
                    "resume task failed: {join_err}"
                ))),
            };
            manager.finish_wake(&key, result);
        });
    }

    fn finish_wake(&self, key: &str, result: Result<(), ControlError>) {
        let result = result.map_err(Arc::new);
        let mut records = self.records();
        let Some(entry) = records.get_mut(key) else {
            return;
        };

        match &result {
            Ok(()) => info!(%key, hostname = %entry.instance, "VM resumed"),
            Err(e) => error!(%key, hostname = %entry.instance, error = %e, "VM wake failed"),
        }

        let outcome = result.clone().map(|()| entry.address.clone());
        if let Some(signal) = entry.end_wake(result) {
            signal.fire(outcome);
        }
    }

    /// Record a routed request. No-op for unknown keys.
    pub fn touch_activity(&self, key: &str) {
        if let Some(entry) = self.records().get_mut(key) {
            entry.last_activity = Instant::now();
        }
    }

    /// Keys that are running and have seen no activity for longer than
    /// `idle_timeout`.
    pub fn idle_keys(&self, idle_timeout: Duration) -> Vec<String> {
        let now = Instant::now();
        self.records()
            .values()
            .filter(|e| {
                e.state == LifecycleState::Running
                    && now.saturating_duration_since(e.last_activity) > idle_timeout
            })
            .map(|e| e.key.clone())
            .collect()
    }

    /// Record that the VM for `key` was paused by the control plane.
    ///
    /// `NotFound` stays terminal and an in-flight wake is left to finish,
    /// since its signal must not be orphaned.
    pub fn mark_paused(&self, key: &str) {
        let mut records = self.records();
        let Some(entry) = records.get_mut(key) else {
            return;
        };
        match entry.state {
            LifecycleState::NotFound => {}
            LifecycleState::Waking => {
                debug!(%key, "pause confirmed during wake, keeping wake");
            }
            _ => entry.state = LifecycleState::Paused,
        }
    }

    /// Control plane handle for `key`, if known.
    pub fn instance_handle(&self, key: &str) -> Option<String> {
        self.records()
            .get(key)
            .map(|e| e.instance.clone())
            .filter(|h| !h.is_empty())
    }

    /// Cached record for `key` without consulting the control plane.
    pub fn snapshot(&self, key: &str) -> Option<InstanceRecord> {
        self.records().get(key).map(VmEntry::snapshot)
    }

    /// Cached lifecycle state, without consulting the control plane.
    pub fn state_of(&self, key: &str) -> Option<LifecycleState> {
        self.records().get(key).map(|e| e.state)
    }

    /// Number of cached keys.
    pub fn len(&self) -> usize {
        self.records().len()
    }

    /// No keys cached yet.
    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relight_control::{MemoryControlPlane, NodeInfo, RemoteStatus};

    fn manager_with(nodes: Vec<NodeInfo>) -> (VmStateManager, Arc<MemoryControlPlane>) {
        let cp = MemoryControlPlane::new();
        for node in nodes {
            cp.add_node(node);
        }
        let cp = Arc::new(cp);
        (VmStateManager::new(cp.clone()), cp)
    }

    fn alpha(status: RemoteStatus) -> NodeInfo {
        NodeInfo::new("vm-alpha", "10.0.0.5", status).with_tag("alpha")
    }

    #[tokio::test]
    async fn lookup_populates_then_hits_cache() {
        let (mgr, cp) = manager_with(vec![alpha(RemoteStatus::Paused)]);

        let record = mgr.lookup("alpha").await.unwrap();
        assert_eq!(record.state, LifecycleState::Paused);
        assert_eq!(record.instance, "vm-alpha");
        assert_eq!(record.address, "10.0.0.5");

        mgr.lookup("alpha").await.unwrap();
        assert_eq!(cp.describe_calls(), 1);
        assert_eq!(mgr.len(), 1);
    }

    #[tokio::test]
    async fn unknown_key_is_cached_as_not_found() {
        let (mgr, cp) = manager_with(vec![]);

        let record = mgr.lookup("ghost").await.unwrap();
        assert_eq!(record.state, LifecycleState::NotFound);

        let err = mgr.ensure_running("ghost", Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_not_found());
        let err = mgr.ensure_running("ghost", Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_not_found());

        assert_eq!(cp.describe_calls(), 1);
        assert_eq!(cp.resume_calls(), 0);
    }

    #[tokio::test]
    async fn describe_failure_is_not_cached() {
        let (mgr, cp) = manager_with(vec![alpha(RemoteStatus::Running)]);
        cp.fail_describe(true);

        let err = mgr.lookup("alpha").await.unwrap_err();
        assert!(matches!(err, StateError::Transport { .. }));
        assert!(mgr.is_empty());

        cp.fail_describe(false);
        let record = mgr.lookup("alpha").await.unwrap();
        assert_eq!(record.state, LifecycleState::Running);
        assert_eq!(cp.describe_calls(), 2);
    }

    #[tokio::test]
    async fn running_key_returns_address_without_network() {
        let (mgr, cp) = manager_with(vec![alpha(RemoteStatus::Running)]);
        mgr.lookup("alpha").await.unwrap();

        for _ in 0..3 {
            let addr = mgr.ensure_running("alpha", Duration::from_secs(1)).await.unwrap();
            assert_eq!(addr, "10.0.0.5");
        }
        assert_eq!(cp.describe_calls(), 1);
        assert_eq!(cp.resume_calls(), 0);
    }

    #[tokio::test]
    async fn unknown_remote_status_triggers_wake() {
        let node = NodeInfo {
            hostname: "vm-alpha".to_string(),
            address: "10.0.0.5".to_string(),
            status: "Stopped".to_string(),
            tags: vec!["alpha".to_string()],
        };
        let (mgr, cp) = manager_with(vec![node]);

        assert_eq!(mgr.lookup("alpha").await.unwrap().state, LifecycleState::Unknown);
        let addr = mgr.ensure_running("alpha", Duration::from_secs(1)).await.unwrap();
        assert_eq!(addr, "10.0.0.5");
        assert_eq!(mgr.state_of("alpha"), Some(LifecycleState::Running));
        assert_eq!(cp.resume_calls(), 1);
    }

    #[tokio::test]
    async fn touch_never_creates_records() {
        let (mgr, _cp) = manager_with(vec![]);
        mgr.touch_activity("alpha");
        assert!(mgr.is_empty());
        assert!(mgr.snapshot("alpha").is_none());
    }

    #[tokio::test]
    async fn mark_paused_leaves_not_found_terminal() {
        let (mgr, _cp) = manager_with(vec![]);
        mgr.lookup("ghost").await.unwrap();
        mgr.mark_paused("ghost");
        assert_eq!(mgr.state_of("ghost"), Some(LifecycleState::NotFound));

        // Missing keys are ignored.
        mgr.mark_paused("nobody");
        assert!(mgr.state_of("nobody").is_none());
    }

    #[tokio::test]
    async fn mark_paused_keeps_last_activity() {
        let (mgr, _cp) = manager_with(vec![alpha(RemoteStatus::Running)]);
        mgr.lookup("alpha").await.unwrap();
        let before = mgr.snapshot("alpha").unwrap().last_activity;

        mgr.mark_paused("alpha");
        let after = mgr.snapshot("alpha").unwrap();
        assert_eq!(after.state, LifecycleState::Paused);
        assert_eq!(after.last_activity, before);
    }

    #[tokio::test]
    async fn instance_handle_is_empty_for_not_found() {
        let (mgr, _cp) = manager_with(vec![alpha(RemoteStatus::Running)]);
        mgr.lookup("alpha").await.unwrap();
        mgr.lookup("ghost").await.unwrap();

        assert_eq!(mgr.instance_handle("alpha").as_deref(), Some("vm-alpha"));
        assert!(mgr.instance_handle("ghost").is_none());
        assert!(mgr.instance_handle("nobody").is_none());
    }
}
