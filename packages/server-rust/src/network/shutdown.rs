//! Process health state and per-listener drain tracking.
//!
//! Every inbound request holds an [`InFlightGuard`] bound to the listener
//! that accepted it. A listener drains on its own count; the process
//! reaches `Stopped` once the last listener has drained and nothing is in
//! flight anywhere. Drain waits are woken by the guard that releases the
//! last request, not by polling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::service::request::Protocol;

/// `Starting -> Ready -> Draining -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Starting,
    Ready,
    Draining,
    Stopped,
}

impl HealthState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            HealthState::Starting => "starting",
            HealthState::Ready => "ready",
            HealthState::Draining => "draining",
            HealthState::Stopped => "stopped",
        }
    }
}

/// Request count for one scope plus a wakeup for whoever waits on zero.
#[derive(Debug, Default)]
struct InFlight {
    count: AtomicU64,
    idle: Notify,
}

impl InFlight {
    fn enter(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    fn leave(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    fn load(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    async fn idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // Registered before the check so a release in between is not lost.
            notified.as_mut().enable();
            if self.load() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug)]
pub struct ShutdownController {
    signal: CancellationToken,
    state: ArcSwap<HealthState>,
    total: Arc<InFlight>,
    http: Arc<InFlight>,
    rpc: Arc<InFlight>,
}

impl ShutdownController {
    #[must_use]
    pub fn new() -> Self {
        Self {
            signal: CancellationToken::new(),
            state: ArcSwap::from_pointee(HealthState::Starting),
            total: Arc::default(),
            http: Arc::default(),
            rpc: Arc::default(),
        }
    }

    fn listener(&self, protocol: Protocol) -> &Arc<InFlight> {
        match protocol {
            Protocol::Http => &self.http,
            Protocol::Rpc => &self.rpc,
        }
    }

    pub fn set_ready(&self) {
        self.state.store(Arc::new(HealthState::Ready));
    }

    /// Cancelled once shutdown has been triggered.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.signal.clone()
    }

    /// Moves to `Draining` and cancels the shutdown token. Later calls
    /// never move a `Stopped` process back to `Draining`.
    pub fn trigger_shutdown(&self) {
        if self.health_state() != HealthState::Stopped {
            self.state.store(Arc::new(HealthState::Draining));
        }
        self.signal.cancel();
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.signal.is_cancelled()
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        **self.state.load()
    }

    /// Counts one request against `protocol`'s listener until the guard is
    /// dropped, unwinding included.
    #[must_use]
    pub fn in_flight_guard(&self, protocol: Protocol) -> InFlightGuard {
        let listener = Arc::clone(self.listener(protocol));
        listener.enter();
        self.total.enter();
        InFlightGuard {
            listener,
            total: Arc::clone(&self.total),
        }
    }

    /// Requests in flight across every listener.
    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.total.load()
    }

    #[must_use]
    pub fn listener_in_flight(&self, protocol: Protocol) -> u64 {
        self.listener(protocol).load()
    }

    /// Waits until `protocol`'s listener has nothing in flight. Moves to
    /// `Stopped` if no other listener has requests left either. Returns
    /// `false`, leaving the state untouched, if `timeout` expires first.
    pub async fn drain_listener(&self, protocol: Protocol, timeout: Duration) -> bool {
        if tokio::time::timeout(timeout, self.listener(protocol).idle()).await.is_err() {
            return false;
        }
        if self.total.load() == 0 {
            self.state.store(Arc::new(HealthState::Stopped));
        }
        true
    }

    /// Waits until no request is in flight on any listener, then moves to
    /// `Stopped`. Returns `false`, leaving the state at `Draining`, if
    /// `timeout` expires first.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        if tokio::time::timeout(timeout, self.total.idle()).await.is_err() {
            return false;
        }
        self.state.store(Arc::new(HealthState::Stopped));
        true
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct InFlightGuard {
    listener: Arc<InFlight>,
    total: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.listener.leave();
        self.total.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine() {
        let controller = ShutdownController::new();
        assert_eq!(controller.health_state(), HealthState::Starting);
        controller.set_ready();
        assert_eq!(controller.health_state(), HealthState::Ready);
        assert!(!controller.is_shutting_down());
        controller.trigger_shutdown();
        assert_eq!(controller.health_state(), HealthState::Draining);
        assert!(controller.is_shutting_down());
        assert_eq!(controller.health_state().as_str(), "draining");
    }

    #[test]
    fn guards_count_per_listener_and_in_total() {
        let controller = ShutdownController::new();
        let a = controller.in_flight_guard(Protocol::Http);
        let b = controller.in_flight_guard(Protocol::Rpc);
        let c = controller.in_flight_guard(Protocol::Rpc);
        assert_eq!(controller.in_flight_count(), 3);
        assert_eq!(controller.listener_in_flight(Protocol::Http), 1);
        assert_eq!(controller.listener_in_flight(Protocol::Rpc), 2);
        drop(b);
        assert_eq!(controller.listener_in_flight(Protocol::Rpc), 1);
        drop((a, c));
        assert_eq!(controller.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_token_is_cancelled_on_trigger() {
        let controller = ShutdownController::new();
        let token = controller.shutdown_token();
        assert!(!token.is_cancelled());
        controller.trigger_shutdown();
        token.cancelled().await;
        assert!(controller.is_shutting_down());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_wakes_when_last_guard_drops() {
        let controller = Arc::new(ShutdownController::new());
        let guard = controller.in_flight_guard(Protocol::Http);
        controller.trigger_shutdown();

        let start = tokio::time::Instant::now();
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });
        assert!(controller.wait_for_drain(Duration::from_secs(2)).await);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(controller.health_state(), HealthState::Stopped);
        release.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn drain_times_out() {
        let controller = ShutdownController::new();
        let _guard = controller.in_flight_guard(Protocol::Rpc);
        controller.trigger_shutdown();
        assert!(!controller.wait_for_drain(Duration::from_millis(50)).await);
        assert_eq!(controller.health_state(), HealthState::Draining);
    }

    #[tokio::test(start_paused = true)]
    async fn listener_drains_independently_of_the_other() {
        let controller = ShutdownController::new();
        let rpc = controller.in_flight_guard(Protocol::Rpc);
        controller.trigger_shutdown();

        // HTTP has nothing in flight, but RPC still does.
        assert!(controller.drain_listener(Protocol::Http, Duration::from_millis(10)).await);
        assert_eq!(controller.health_state(), HealthState::Draining);
        assert!(!controller.drain_listener(Protocol::Rpc, Duration::from_millis(10)).await);

        drop(rpc);
        assert!(controller.drain_listener(Protocol::Rpc, Duration::from_millis(10)).await);
        assert_eq!(controller.health_state(), HealthState::Stopped);
    }

    #[test]
    fn late_trigger_keeps_stopped_state() {
        let controller = ShutdownController::new();
        controller.trigger_shutdown();
        controller.state.store(Arc::new(HealthState::Stopped));
        controller.trigger_shutdown();
        assert_eq!(controller.health_state(), HealthState::Stopped);
    }
}
