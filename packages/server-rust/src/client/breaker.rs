//! Per-(client, method) circuit breakers.
//!
//! The registry is a process-wide map from breaker name to cell. The map
//! lock is held only to look up or insert a cell; each cell synchronizes
//! itself. The rolling window is ten one-second buckets of atomic counters,
//! and state transitions happen under a short `parking_lot` critical
//! section. Concurrency is bounded by a semaphore, in the same way the
//! load-shedding layer bounds in-flight work.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use switchyard_core::{ClockSource, ConfigError, StaticConfig, SystemClock};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::service::metrics::{names, ContextMetrics};

const WINDOW_BUCKETS: usize = 10;
const BUCKET_MILLIS: u64 = 1000;
const EMPTY_BUCKET: u64 = u64::MAX;

/// Tag key carrying the breaker name.
pub const BREAKER_TAG: &str = "circuitbreaker";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Breaker parameters. Defaults follow the common Hystrix settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Upper bound on a single guarded attempt, applied on top of the
    /// caller's per-attempt budget.
    pub timeout: Duration,
    pub max_concurrent: usize,
    pub error_percent_threshold: u64,
    pub sleep_window: Duration,
    pub request_volume_threshold: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            max_concurrent: 20,
            error_percent_threshold: 20,
            sleep_window: Duration::from_millis(5000),
            request_volume_threshold: 20,
        }
    }
}

fn non_negative(config: &StaticConfig, key: &str, default: u64) -> Result<u64, ConfigError> {
    let raw = config.int_or(key, i64::try_from(default).unwrap_or(i64::MAX))?;
    Ok(u64::try_from(raw).unwrap_or(0))
}

impl CircuitBreakerConfig {
    /// Reads `clients.<id>.sleepWindowInMilliseconds`,
    /// `maxConcurrentRequests`, `errorPercentThreshold` and
    /// `requestVolumeThreshold`. `timeout` is the client timeout.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when a present key is not an integer.
    pub fn from_config(config: &StaticConfig, client_id: &str, timeout: Duration) -> Result<Self, ConfigError> {
        let d = Self::default();
        let key = |k: &str| format!("clients.{client_id}.{k}");
        Ok(Self {
            timeout,
            max_concurrent: usize::try_from(non_negative(
                config,
                &key("maxConcurrentRequests"),
                d.max_concurrent as u64,
            )?)
            .unwrap_or(d.max_concurrent),
            error_percent_threshold: non_negative(config, &key("errorPercentThreshold"), d.error_percent_threshold)?,
            sleep_window: Duration::from_millis(non_negative(
                config,
                &key("sleepWindowInMilliseconds"),
                5000,
            )?),
            request_volume_threshold: non_negative(config, &key("requestVolumeThreshold"), d.request_volume_threshold)?,
        })
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    /// Value reported on the state gauge.
    #[must_use]
    pub fn gauge_value(self) -> f64 {
        match self {
            BreakerState::Closed => 0.0,
            BreakerState::Open => 1.0,
            BreakerState::HalfOpen => 2.0,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        }
    }
}

/// Why admission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BreakerRejection {
    #[error("circuit is open")]
    Open,
    #[error("half-open probe already in flight")]
    ProbeInFlight,
    #[error("max concurrency reached")]
    MaxConcurrency,
}

impl BreakerRejection {
    fn reason(self) -> &'static str {
        match self {
            BreakerRejection::Open => "open",
            BreakerRejection::ProbeInFlight => "half-open",
            BreakerRejection::MaxConcurrency => "max-concurrency",
        }
    }
}

// ---------------------------------------------------------------------------
// Rolling window
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Bucket {
    second: AtomicU64,
    samples: AtomicU64,
    errors: AtomicU64,
}

impl Bucket {
    fn new() -> Self {
        Self {
            second: AtomicU64::new(EMPTY_BUCKET),
            samples: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }
}

#[derive(Debug)]
struct RollingWindow {
    buckets: [Bucket; WINDOW_BUCKETS],
    /// Serializes bucket rollover; counting stays lock-free.
    roll: Mutex<()>,
}

impl RollingWindow {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| Bucket::new()),
            roll: Mutex::new(()),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn record(&self, now_ms: u64, error: bool) {
        let second = now_ms / BUCKET_MILLIS;
        let bucket = &self.buckets[(second % WINDOW_BUCKETS as u64) as usize];
        if bucket.second.load(Ordering::Acquire) != second {
            let _roll = self.roll.lock();
            // Counters are zeroed before the new second is published, so no
            // increment for `second` can land ahead of the reset.
            if bucket.second.load(Ordering::Acquire) != second {
                bucket.samples.store(0, Ordering::Release);
                bucket.errors.store(0, Ordering::Release);
                bucket.second.store(second, Ordering::Release);
            }
        }
        bucket.samples.fetch_add(1, Ordering::AcqRel);
        if error {
            bucket.errors.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// `(samples, errors)` over the last ten seconds.
    fn totals(&self, now_ms: u64) -> (u64, u64) {
        let current = now_ms / BUCKET_MILLIS;
        let oldest = current.saturating_sub(WINDOW_BUCKETS as u64 - 1);
        self.buckets
            .iter()
            .filter(|b| {
                let s = b.second.load(Ordering::Acquire);
                s != EMPTY_BUCKET && s >= oldest && s <= current
            })
            .fold((0, 0), |(samples, errors), b| {
                (
                    samples + b.samples.load(Ordering::Acquire),
                    errors + b.errors.load(Ordering::Acquire),
                )
            })
    }

    fn clear(&self) {
        let _roll = self.roll.lock();
        for bucket in &self.buckets {
            bucket.second.store(EMPTY_BUCKET, Ordering::Release);
            bucket.samples.store(0, Ordering::Release);
            bucket.errors.store(0, Ordering::Release);
        }
    }
}

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Transition {
    state: BreakerState,
    opened_at: u64,
    probe_in_flight: bool,
}

/// One breaker cell.
pub struct CircuitBreaker {
    name: String,
    config: ArcSwap<CircuitBreakerConfig>,
    window: RollingWindow,
    transition: Mutex<Transition>,
    permits: ArcSwap<Semaphore>,
    clock: Arc<dyn ClockSource>,
    metrics: ContextMetrics,
}

impl CircuitBreaker {
    fn new(
        name: &str,
        config: CircuitBreakerConfig,
        clock: Arc<dyn ClockSource>,
        metrics: &ContextMetrics,
    ) -> Self {
        Self {
            name: name.to_string(),
            permits: ArcSwap::from_pointee(Semaphore::new(config.max_concurrent)),
            config: ArcSwap::from_pointee(config),
            window: RollingWindow::new(),
            transition: Mutex::new(Transition {
                state: BreakerState::Closed,
                opened_at: 0,
                probe_in_flight: false,
            }),
            clock,
            metrics: metrics.tagged([(BREAKER_TAG, name)]),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> CircuitBreakerConfig {
        **self.config.load()
    }

    /// Current state, applying the sleep-window expiry without admitting.
    #[must_use]
    pub fn state(&self) -> BreakerState {
        let t = self.transition.lock();
        if t.state == BreakerState::Open
            && self.clock.now_millis().saturating_sub(t.opened_at) >= self.sleep_window_ms()
        {
            BreakerState::HalfOpen
        } else {
            t.state
        }
    }

    /// `(samples, errors)` in the current window.
    #[must_use]
    pub fn counts(&self) -> (u64, u64) {
        self.window.totals(self.clock.now_millis())
    }

    fn sleep_window_ms(&self) -> u64 {
        u64::try_from(self.config.load().sleep_window.as_millis()).unwrap_or(u64::MAX)
    }

    fn reconfigure(&self, config: CircuitBreakerConfig) {
        let previous = self.config.swap(Arc::new(config));
        if previous.max_concurrent != config.max_concurrent {
            self.permits.store(Arc::new(Semaphore::new(config.max_concurrent)));
        }
    }

    fn set_state(&self, t: &mut Transition, state: BreakerState, now: u64) {
        if t.state != state {
            tracing::info!(
                breaker = %self.name,
                from = t.state.as_str(),
                to = state.as_str(),
                "Circuit breaker state change"
            );
        }
        t.state = state;
        if state == BreakerState::Open {
            t.opened_at = now;
        }
        self.metrics.update_gauge(names::BREAKER_STATE, state.gauge_value());
    }

    fn should_trip(&self, now: u64) -> bool {
        let config = self.config.load();
        let (samples, errors) = self.window.totals(now);
        samples >= config.request_volume_threshold
            && samples > 0
            && errors * 100 >= config.error_percent_threshold * samples
    }

    fn reject(&self, rejection: BreakerRejection) -> BreakerRejection {
        self.metrics
            .tagged([("reason", rejection.reason())])
            .inc_counter(names::BREAKER_REJECTED, 1);
        rejection
    }

    /// Asks for admission of one attempt.
    ///
    /// # Errors
    ///
    /// Returns the rejection reason when the breaker is open, a half-open
    /// probe is already running, or the concurrency limit is reached.
    pub fn try_acquire(self: &Arc<Self>) -> Result<BreakerPermit, BreakerRejection> {
        let now = self.clock.now_millis();
        let probe = {
            let mut t = self.transition.lock();
            match t.state {
                BreakerState::Closed => {
                    if self.should_trip(now) {
                        self.set_state(&mut t, BreakerState::Open, now);
                        return Err(self.reject(BreakerRejection::Open));
                    }
                    false
                }
                BreakerState::Open => {
                    if now.saturating_sub(t.opened_at) < self.sleep_window_ms() {
                        return Err(self.reject(BreakerRejection::Open));
                    }
                    self.set_state(&mut t, BreakerState::HalfOpen, now);
                    t.probe_in_flight = true;
                    true
                }
                BreakerState::HalfOpen => {
                    if t.probe_in_flight {
                        return Err(self.reject(BreakerRejection::ProbeInFlight));
                    }
                    t.probe_in_flight = true;
                    true
                }
            }
        };

        let Ok(permit) = self.permits.load_full().try_acquire_owned() else {
            if probe {
                self.transition.lock().probe_in_flight = false;
            }
            return Err(self.reject(BreakerRejection::MaxConcurrency));
        };

        Ok(BreakerPermit {
            breaker: Arc::clone(self),
            probe,
            settled: false,
            _permit: permit,
        })
    }

    fn settle(&self, probe: bool, failure: bool) {
        let now = self.clock.now_millis();
        self.window.record(now, failure);
        if !probe {
            return;
        }
        let mut t = self.transition.lock();
        t.probe_in_flight = false;
        if failure {
            self.set_state(&mut t, BreakerState::Open, now);
        } else {
            self.window.clear();
            self.set_state(&mut t, BreakerState::Closed, now);
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config())
            .field("state", &self.transition.lock().state)
            .finish_non_exhaustive()
    }
}

/// Admission for one attempt. Dropping it unsettled records nothing.
#[must_use = "settle the permit with record_success or record_failure"]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    probe: bool,
    settled: bool,
    _permit: OwnedSemaphorePermit,
}

impl BreakerPermit {
    #[must_use]
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.settle(self.probe, false);
    }

    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.settle(self.probe, true);
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if self.probe && !self.settled {
            self.breaker.transition.lock().probe_in_flight = false;
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub samples: u64,
    pub errors: u64,
    pub config: CircuitBreakerConfig,
}

/// Process-wide breaker table, keyed by `"<client_id>-<method>"`.
pub struct CircuitBreakerRegistry {
    cells: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    clock: Arc<dyn ClockSource>,
    metrics: ContextMetrics,
}

impl CircuitBreakerRegistry {
    #[must_use]
    pub fn new(clock: Arc<dyn ClockSource>, metrics: ContextMetrics) -> Self {
        Self {
            cells: RwLock::new(HashMap::new()),
            clock,
            metrics,
        }
    }

    #[must_use]
    pub fn with_system_clock(metrics: ContextMetrics) -> Self {
        Self::new(Arc::new(SystemClock), metrics)
    }

    /// Builds the canonical breaker name.
    #[must_use]
    pub fn breaker_name(client_id: &str, method: &str) -> String {
        format!("{client_id}-{method}")
    }

    /// Installs or re-applies configuration for `name`. Re-applying keeps
    /// the rolling window and the current state.
    pub fn configure(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(cell) = self.cells.read().get(name) {
            cell.reconfigure(config);
            return Arc::clone(cell);
        }
        let mut cells = self.cells.write();
        let cell = cells.entry(name.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(name, config, Arc::clone(&self.clock), &self.metrics))
        });
        cell.reconfigure(config);
        Arc::clone(cell)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.cells.read().get(name).cloned()
    }

    /// All breakers, sorted by name.
    #[must_use]
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let cells: Vec<Arc<CircuitBreaker>> = self.cells.read().values().cloned().collect();
        let mut out: Vec<BreakerSnapshot> = cells
            .iter()
            .map(|cell| {
                let (samples, errors) = cell.counts();
                BreakerSnapshot {
                    name: cell.name().to_string(),
                    state: cell.state(),
                    samples,
                    errors,
                    config: cell.config(),
                }
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("breakers", &self.cells.read().len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
