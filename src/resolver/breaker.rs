//! Circuit breaker shared by every reasoning-service call

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::BreakerConfig;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    /// Calls flow normally
    Closed,
    /// Calls are short-circuited
    Open,
    /// Cool-down elapsed; a single trial call is allowed
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    /// Failure times within the rolling window, oldest first
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Counters that only ever grow
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerStats {
    pub trips: u64,
    pub rejections: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
    trips: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                trial_in_flight: false,
            }),
            trips: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current state, moving `open` to `half-open` once the cool-down has elapsed
    pub fn state(&self) -> BreakerState {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        inner.state
    }

    pub fn stats(&self) -> BreakerStats {
        BreakerStats {
            trips: self.trips.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
        }
    }

    fn refresh(&self, inner: &mut Inner) {
        if inner.state == BreakerState::Open
            && let Some(opened_at) = inner.opened_at
            && opened_at.elapsed() >= self.config.cooldown()
        {
            info!("Circuit breaker half-open, allowing a trial");
            inner.state = BreakerState::HalfOpen;
            inner.trial_in_flight = false;
        }
    }

    /// Whether a call would be short-circuited right now; counted as a rejection
    /// when it would
    pub fn rejects(&self) -> bool {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        let rejecting = match inner.state {
            BreakerState::Closed => false,
            BreakerState::HalfOpen => inner.trial_in_flight,
            BreakerState::Open => true,
        };
        if rejecting {
            self.rejections.fetch_add(1, Ordering::Relaxed);
        }
        rejecting
    }

    /// Ask to make a call. `None` means the call must be short-circuited.
    pub fn try_acquire(&self) -> Option<BreakerPermit<'_>> {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        match inner.state {
            BreakerState::Closed => Some(BreakerPermit::new(self, false)),
            BreakerState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                Some(BreakerPermit::new(self, true))
            }
            BreakerState::Open | BreakerState::HalfOpen => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn record_success(&self, trial: bool) {
        let mut inner = self.lock();
        inner.failures.clear();
        if trial && inner.state == BreakerState::HalfOpen {
            info!("Circuit breaker closed after successful trial");
            inner.state = BreakerState::Closed;
            inner.opened_at = None;
            inner.trial_in_flight = false;
        }
    }

    fn record_failure(&self, trial: bool) {
        let mut inner = self.lock();
        let now = Instant::now();

        if trial {
            warn!("Circuit breaker trial failed, reopening");
            self.trip(&mut inner, now);
            return;
        }
        if inner.state != BreakerState::Closed {
            return;
        }

        inner.failures.push_back(now);
        let window = self.config.window();
        while inner
            .failures
            .front()
            .is_some_and(|&t| now.duration_since(t) > window)
        {
            inner.failures.pop_front();
        }
        if inner.failures.len() >= self.config.failure_threshold as usize {
            warn!(
                "Circuit breaker opened after {} failures within {:?}",
                inner.failures.len(),
                window
            );
            self.trip(&mut inner, now);
        }
    }

    fn trip(&self, inner: &mut Inner, now: Instant) {
        inner.state = BreakerState::Open;
        inner.opened_at = Some(now);
        inner.failures.clear();
        inner.trial_in_flight = false;
        self.trips.fetch_add(1, Ordering::Relaxed);
    }
}

/// Admission to make one call. Dropping it unsettled counts as a failure.
#[derive(Debug)]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> BreakerPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn succeed(mut self) {
        self.settled = true;
        self.breaker.record_success(self.trial);
    }

    pub fn fail(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.trial);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.record_failure(self.trial);
        }
    }
}
