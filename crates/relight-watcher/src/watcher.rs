//! Idle watcher: background task that pauses idle VMs.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use relight_control::ControlPlane;
use relight_state::VmStateManager;

/// Timing for the idle watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchConfig {
    /// Time between ticks.
    pub interval: Duration,
    /// Inactivity after which a running VM is paused.
    pub idle_timeout: Duration,
}

/// Outcome of one tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickStats {
    /// Keys found idle at the start of the tick.
    pub idle: u32,
    /// Pause calls that succeeded.
    pub paused: u32,
    /// Pause calls that returned an error; retried next tick.
    pub failed: u32,
    /// Idle keys that had no instance handle by the time they came up.
    pub skipped: u32,
}

/// Background loop state while the watcher is running.
struct WatcherSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Periodically pauses VMs that have been idle for too long.
pub struct IdleWatcher {
    state: VmStateManager,
    control: Arc<dyn ControlPlane>,
    config: WatchConfig,
    slot: Mutex<Option<WatcherSlot>>,
}

impl IdleWatcher {
    /// Create a stopped watcher. Call [`start`](Self::start) to begin ticking.
    pub fn new(state: VmStateManager, control: Arc<dyn ControlPlane>, config: WatchConfig) -> Self {
        Self {
            state,
            control,
            config,
            slot: Mutex::new(None),
        }
    }

    /// Effective interval and idle timeout.
    pub fn config(&self) -> WatchConfig {
        self.config
    }

    fn slot(&self) -> MutexGuard<'_, Option<WatcherSlot>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the background loop. Returns `false` if it is already running.
    pub fn start(&self) -> bool {
        let mut slot = self.slot();
        if slot.as_ref().is_some_and(|s| !s.handle.is_finished()) {
            return false;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = self.state.clone();
        let control = Arc::clone(&self.control);
        let config = self.config;

        let handle = tokio::spawn(async move {
            run_idle_loop(state, control, config, shutdown_rx).await;
        });

        *slot = Some(WatcherSlot {
            handle,
            shutdown_tx,
        });
        true
    }

    /// Signal the loop to stop and return immediately.
    ///
    /// A tick in progress finishes the pause call it is waiting on and
    /// skips the rest. Returns `false` if the watcher was not running.
    pub fn stop(&self) -> bool {
        match self.slot().take() {
            Some(slot) => {
                let _ = slot.shutdown_tx.send(true);
                true
            }
            None => false,
        }
    }

    /// Signal the loop to stop and wait for it to exit.
    pub async fn stop_and_wait(&self) {
        let slot = self.slot().take();
        if let Some(slot) = slot {
            let _ = slot.shutdown_tx.send(true);
            if let Err(e) = slot.handle.await {
                error!(error = %e, "idle watcher task failed");
            }
        }
    }

    /// Whether the background loop is alive. `false` after `stop`, or
    /// once the loop has exited on its own.
    pub fn is_running(&self) -> bool {
        self.slot()
            .as_ref()
            .is_some_and(|s| !s.handle.is_finished())
    }

    /// Run one tick now, outside the background loop.
    pub async fn tick(&self) -> TickStats {
        let (_tx, shutdown) = watch::channel(false);
        pause_idle_vms(
            &self.state,
            self.control.as_ref(),
            self.config.idle_timeout,
            &shutdown,
        )
        .await
    }
}

impl Drop for IdleWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_idle_loop(
    state: VmStateManager,
    control: Arc<dyn ControlPlane>,
    config: WatchConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + config.interval, config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        interval = ?config.interval,
        idle_timeout = ?config.idle_timeout,
        "idle watcher started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let state = state.clone();
                let control = Arc::clone(&control);
                let tick_shutdown = shutdown.clone();
                let tick = tokio::spawn(async move {
                    pause_idle_vms(&state, control.as_ref(), config.idle_timeout, &tick_shutdown).await
                });

                match tick.await {
                    Ok(stats) if stats.idle > 0 => debug!(?stats, "idle watcher tick complete"),
                    Ok(_) => {}
                    Err(e) if e.is_panic() => error!(error = %e, "idle watcher tick panicked"),
                    Err(e) => error!(error = %e, "idle watcher tick failed"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    info!("idle watcher stopped");
}

/// Pause every VM idle for longer than `idle_timeout`.
///
/// Shutdown is checked before each pause call; a call already in flight
/// is allowed to finish.
async fn pause_idle_vms(
    state: &VmStateManager,
    control: &dyn ControlPlane,
    idle_timeout: Duration,
    shutdown: &watch::Receiver<bool>,
) -> TickStats {
    let idle = state.idle_keys(idle_timeout);
    let mut stats = TickStats {
        idle: idle.len() as u32,
        ..TickStats::default()
    };

    for key in idle {
        if *shutdown.borrow() {
            debug!(%key, "idle watcher stopping mid-tick");
            break;
        }

        let Some(hostname) = state.instance_handle(&key) else {
            stats.skipped += 1;
            continue;
        };

        info!(%key, %hostname, "pausing idle VM");
        match control.pause(&hostname).await {
            Ok(()) => {
                state.mark_paused(&key);
                stats.paused += 1;
                info!(%key, %hostname, "VM paused");
            }
            Err(e) => {
                stats.failed += 1;
                error!(%key, %hostname, error = %e, "failed to pause VM");
            }
        }
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use relight_control::{
        BoxFuture, ControlResult, MemoryControlPlane, NodeInfo, RemoteStatus,
    };
    use relight_state::LifecycleState;

    fn running(hostname: &str, address: &str, tag: &str) -> NodeInfo {
        NodeInfo::new(hostname, address, RemoteStatus::Running).with_tag(tag)
    }

    fn config() -> WatchConfig {
        WatchConfig {
            interval: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(15),
        }
    }

    async fn setup(nodes: Vec<NodeInfo>) -> (VmStateManager, Arc<MemoryControlPlane>) {
        let cp = MemoryControlPlane::new();
        let keys: Vec<String> = nodes.iter().flat_map(|n| n.tags.clone()).collect();
        for node in nodes {
            cp.add_node(node);
        }
        let cp = Arc::new(cp);
        let state = VmStateManager::new(cp.clone());
        for key in keys {
            state.lookup(&key).await.unwrap();
        }
        (state, cp)
    }

    #[tokio::test(start_paused = true)]
    async fn tick_pauses_idle_running_vms() {
        let (state, cp) = setup(vec![
            running("vm-a", "10.0.0.1", "a"),
            running("vm-b", "10.0.0.2", "b"),
        ])
        .await;
        let watcher = IdleWatcher::new(state.clone(), cp.clone(), config());

        tokio::time::advance(Duration::from_secs(20)).await;
        state.touch_activity("b");

        let stats = watcher.tick().await;
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.paused, 1);
        assert_eq!(state.state_of("a"), Some(LifecycleState::Paused));
        assert_eq!(state.state_of("b"), Some(LifecycleState::Running));
        assert_eq!(cp.status_of("vm-a"), Some(RemoteStatus::Paused));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_pause_does_not_stop_other_keys() {
        let (state, cp) = setup(vec![
            running("vm-a", "10.0.0.1", "a"),
            running("vm-b", "10.0.0.2", "b"),
        ])
        .await;
        cp.fail_pause("vm-a", true);
        let watcher = IdleWatcher::new(state.clone(), cp.clone(), config());

        tokio::time::advance(Duration::from_secs(20)).await;

        let stats = watcher.tick().await;
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.paused, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(state.state_of("a"), Some(LifecycleState::Running));
        assert_eq!(state.state_of("b"), Some(LifecycleState::Paused));

        // Still idle, so the next tick retries it.
        cp.fail_pause("vm-a", false);
        let stats = watcher.tick().await;
        assert_eq!(stats.paused, 1);
        assert_eq!(state.state_of("a"), Some(LifecycleState::Paused));
    }

    #[tokio::test(start_paused = true)]
    async fn background_loop_pauses_on_interval() {
        let (state, cp) = setup(vec![running("vm-a", "10.0.0.1", "a")]).await;
        let watcher = IdleWatcher::new(state.clone(), cp.clone(), config());
        assert!(watcher.start());

        // First tick at 10s: not idle yet.
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(state.state_of("a"), Some(LifecycleState::Running));

        // Second tick at 20s: idle for 20s > 15s.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(state.state_of("a"), Some(LifecycleState::Paused));
        assert_eq!(cp.pause_calls(), 1);

        watcher.stop_and_wait().await;
        assert!(!watcher.is_running());
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let (state, cp) = setup(vec![]).await;
        let watcher = IdleWatcher::new(state, cp, config());

        assert!(!watcher.is_running());
        assert!(watcher.start());
        assert!(!watcher.start());
        assert!(watcher.is_running());

        assert!(watcher.stop());
        assert!(!watcher.stop());
        watcher.stop_and_wait().await;

        // Can be restarted after stopping.
        assert!(watcher.start());
        watcher.stop_and_wait().await;
        assert!(!watcher.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_tick_finishes_in_flight_pause_only() {
        let (state, cp) = setup(vec![
            running("vm-a", "10.0.0.1", "a"),
            running("vm-b", "10.0.0.2", "b"),
        ])
        .await;
        cp.set_pause_delay(Duration::from_secs(5));
        let watcher = IdleWatcher::new(
            state.clone(),
            cp.clone(),
            WatchConfig {
                interval: Duration::from_secs(20),
                idle_timeout: Duration::from_secs(15),
            },
        );
        watcher.start();

        // Tick fires at 20s; the first pause is in flight until 25s.
        tokio::time::sleep(Duration::from_secs(21)).await;
        assert_eq!(cp.pause_calls(), 1);

        watcher.stop_and_wait().await;

        assert_eq!(cp.pause_calls(), 1);
        let paused = ["a", "b"]
            .iter()
            .filter(|k| state.state_of(k) == Some(LifecycleState::Paused))
            .count();
        assert_eq!(paused, 1);
    }

    /// Panics on the first pause call, then behaves.
    struct FlakyPause {
        inner: MemoryControlPlane,
        calls: AtomicUsize,
    }

    fn explode() -> ControlResult<()> {
        panic!("pause exploded")
    }

    impl ControlPlane for FlakyPause {
        fn describe<'a>(&'a self, key: &'a str) -> BoxFuture<'a, ControlResult<Vec<NodeInfo>>> {
            self.inner.describe(key)
        }

        fn resume<'a>(&'a self, hostname: &'a str) -> BoxFuture<'a, ControlResult<()>> {
            self.inner.resume(hostname)
        }

        fn pause<'a>(&'a self, hostname: &'a str) -> BoxFuture<'a, ControlResult<()>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Box::pin(async { explode() });
            }
            self.inner.pause(hostname)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_tick_does_not_kill_the_loop() {
        let cp = Arc::new(FlakyPause {
            inner: MemoryControlPlane::new().with_node(running("vm-a", "10.0.0.1", "a")),
            calls: AtomicUsize::new(0),
        });
        let state = VmStateManager::new(cp.clone());
        state.lookup("a").await.unwrap();

        let watcher = IdleWatcher::new(state.clone(), cp.clone(), config());
        watcher.start();

        // Tick at 20s panics, tick at 30s pauses.
        tokio::time::sleep(Duration::from_secs(21)).await;
        assert_eq!(cp.calls.load(Ordering::SeqCst), 1);
        assert_eq!(state.state_of("a"), Some(LifecycleState::Running));
        assert!(watcher.is_running());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(cp.calls.load(Ordering::SeqCst), 2);
        assert_eq!(state.state_of("a"), Some(LifecycleState::Paused));

        watcher.stop_and_wait().await;
    }

    #[tokio::test]
    async fn dropping_the_watcher_stops_the_loop() {
        let (state, cp) = setup(vec![]).await;
        let watcher = IdleWatcher::new(state, cp, config());
        watcher.start();
        let tx = watcher.slot().as_ref().map(|s| s.shutdown_tx.clone()).unwrap();

        drop(watcher);
        assert!(*tx.borrow());
    }
}
