//! One-shot wake signal shared by every caller waiting on a resume.

use std::sync::Arc;

use relight_control::ControlError;
use tokio::sync::watch;

/// Address on success, the resume error on failure.
pub(crate) type WakeOutcome = Result<String, Arc<ControlError>>;

/// Held by the record while it is `Waking`. Fired exactly once.
#[derive(Debug)]
pub(crate) struct WakeSignal {
    tx: watch::Sender<Option<WakeOutcome>>,
}

/// A waiter's end of a [`WakeSignal`].
pub(crate) struct WakeWaiter {
    rx: watch::Receiver<Option<WakeOutcome>>,
}

impl WakeSignal {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> WakeWaiter {
        WakeWaiter {
            rx: self.tx.subscribe(),
        }
    }

    /// Publish the outcome to all current waiters. Works with zero waiters.
    pub(crate) fn fire(self, outcome: WakeOutcome) {
        self.tx.send_replace(Some(outcome));
    }
}

impl WakeWaiter {
    /// Wait for the outcome. A signal dropped without firing reads as a
    /// failed wake.
    pub(crate) async fn wait(mut self) -> WakeOutcome {
        match self.rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or_else(|| Err(abandoned())),
            Err(_) => Err(abandoned()),
        }
    }
}

fn abandoned() -> Arc<ControlError> {
    Arc::new(ControlError::Remote(
        "wake abandoned before completion".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn all_waiters_see_the_same_outcome() {
        let signal = WakeSignal::new();
        let a = signal.subscribe();
        let b = signal.subscribe();

        let ta = tokio::spawn(a.wait());
        let tb = tokio::spawn(b.wait());
        tokio::task::yield_now().await;

        signal.fire(Ok("10.0.0.5".to_string()));

        assert_eq!(ta.await.unwrap().unwrap(), "10.0.0.5");
        assert_eq!(tb.await.unwrap().unwrap(), "10.0.0.5");
    }

    #[tokio::test]
    async fn waiter_after_fire_still_sees_outcome() {
        let signal = WakeSignal::new();
        let waiter = signal.subscribe();
        signal.fire(Err(Arc::new(ControlError::Remote("boom".to_string()))));

        let err = waiter.wait().await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn dropped_signal_reads_as_failure() {
        let signal = WakeSignal::new();
        let waiter = signal.subscribe();
        drop(signal);

        assert!(waiter.wait().await.is_err());
    }
}
