//! Server lifecycle and in-flight request accounting.
//!
//! State machine: Starting -> Serving -> Draining -> Stopped. While draining
//! the server still reads frames but answers new requests with 503; requests
//! already admitted run to completion.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::{watch, Notify};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Serving,
    Draining,
    Stopped,
}

impl LifecycleState {
    /// Whether new requests are admitted.
    #[must_use]
    pub fn admits_requests(self) -> bool {
        matches!(self, Self::Serving)
    }
}

#[derive(Debug, Default)]
struct InFlight {
    count: AtomicU64,
    drained: Notify,
}

/// Shared by the accept loop, every connection task and every admitted
/// request.
#[derive(Debug)]
pub struct ServerLifecycle {
    state: ArcSwap<LifecycleState>,
    in_flight: Arc<InFlight>,
    changes: watch::Sender<LifecycleState>,
}

impl ServerLifecycle {
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = watch::channel(LifecycleState::Starting);
        Self {
            state: ArcSwap::from_pointee(LifecycleState::Starting),
            in_flight: Arc::new(InFlight::default()),
            changes,
        }
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        **self.state.load()
    }

    fn transition(&self, next: LifecycleState) {
        self.state.store(Arc::new(next));
        self.changes.send_replace(next);
    }

    pub fn set_serving(&self) {
        self.transition(LifecycleState::Serving);
    }

    /// Stops admitting requests.
    pub fn begin_drain(&self) {
        self.transition(LifecycleState::Draining);
    }

    /// Receiver notified on every state change. Connection tasks close once
    /// they observe [`LifecycleState::Stopped`].
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.changes.subscribe()
    }

    /// Counts one admitted request until the guard drops.
    #[must_use]
    pub fn admit(&self) -> InFlightGuard {
        self.in_flight.count.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.in_flight.count.load(Ordering::Acquire)
    }

    /// Waits until no admitted request is running, up to `timeout`, then moves
    /// to Stopped either way. Returns whether everything drained.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let drained = loop {
            let notified = self.in_flight.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                break true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break self.in_flight() == 0;
            }
        };
        self.transition(LifecycleState::Stopped);
        drained
    }
}

impl Default for ServerLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases one in-flight slot on drop, panics included.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.in_flight.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.in_flight.drained.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_are_visible_to_subscribers() {
        let lifecycle = ServerLifecycle::new();
        let rx = lifecycle.subscribe();
        assert_eq!(lifecycle.state(), LifecycleState::Starting);
        assert!(!lifecycle.state().admits_requests());

        lifecycle.set_serving();
        assert!(lifecycle.state().admits_requests());
        lifecycle.begin_drain();
        assert_eq!(*rx.borrow(), LifecycleState::Draining);
        assert!(!lifecycle.state().admits_requests());
    }

    #[test]
    fn guards_track_in_flight() {
        let lifecycle = ServerLifecycle::new();
        let a = lifecycle.admit();
        let b = lifecycle.admit();
        assert_eq!(lifecycle.in_flight(), 2);
        drop(a);
        assert_eq!(lifecycle.in_flight(), 1);
        drop(b);
        assert_eq!(lifecycle.in_flight(), 0);
    }

    #[tokio::test]
    async fn drain_completes_when_last_guard_drops() {
        let lifecycle = Arc::new(ServerLifecycle::new());
        lifecycle.set_serving();
        let guard = lifecycle.admit();
        lifecycle.begin_drain();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(guard);
        });
        assert!(lifecycle.wait_for_drain(Duration::from_secs(2)).await);
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn drain_gives_up_after_timeout() {
        let lifecycle = ServerLifecycle::new();
        let _stuck = lifecycle.admit();
        lifecycle.begin_drain();
        assert!(!lifecycle.wait_for_drain(Duration::from_millis(20)).await);
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
    }
}
