//! Three-state circuit breaker. Counters and the state word live in atomics
//! so the fast path never blocks; only the state *transition* takes a short
//! mutex, inside which the trigger condition is re-checked so a counter
//! reset racing the transition cannot cause a spurious open. Exactly one
//! caller is admitted as the half-open probe.

use crate::config::CircuitBreakerConfig;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

/// Point-in-time view of the breaker, readable without blocking writers.
#[derive(Clone, Copy, Debug)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    /// Elapsed since the breaker was built; `None` until the first event.
    pub last_failure_at: Option<Duration>,
    pub opened_at: Option<Duration>,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    /// Instant zero for the millisecond clocks below.
    origin: Instant,
    state: AtomicU8,
    failures: AtomicU32,
    successes: AtomicU32,
    /// Milliseconds since `origin`; 0 = never.
    last_failure_ms: AtomicU64,
    opened_at_ms: AtomicU64,
    /// Set while the single half-open probe is in flight.
    probe_in_flight: AtomicBool,
    /// Guards state transitions only, never the fast path.
    transition: Mutex<()>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            origin: Instant::now(),
            state: AtomicU8::new(CLOSED),
            failures: AtomicU32::new(0),
            successes: AtomicU32::new(0),
            last_failure_ms: AtomicU64::new(0),
            opened_at_ms: AtomicU64::new(0),
            probe_in_flight: AtomicBool::new(false),
            transition: Mutex::new(()),
        }
    }

    pub fn state(&self) -> CircuitState {
        match self.state.load(Ordering::Acquire) {
            OPEN => CircuitState::Open,
            HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let ms = |v: u64| (v != 0).then(|| Duration::from_millis(v));
        CircuitBreakerSnapshot {
            state: self.state(),
            failure_count: self.failures.load(Ordering::Acquire),
            success_count: self.successes.load(Ordering::Acquire),
            last_failure_at: ms(self.last_failure_ms.load(Ordering::Acquire)),
            opened_at: ms(self.opened_at_ms.load(Ordering::Acquire)),
        }
    }

    /// Run `op` under the breaker. Fails fast with `CircuitOpen` while the
    /// circuit is open or while another caller holds the half-open probe.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with_cancel(&CancellationToken::new(), op).await
    }

    /// Like `execute`, additionally abandoning the call when `cancel` fires.
    pub async fn execute_with_cancel<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let probing = self.admit()?;

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                if probing {
                    self.probe_in_flight.store(false, Ordering::Release);
                }
                return Err(Error::InvocationCancelled { id: "circuit-breaker".into() });
            }
            outcome = op() => outcome,
        };

        match &outcome {
            Ok(_) => self.on_success(probing),
            Err(_) => self.on_failure(probing),
        }
        outcome
    }

    /// Decide whether the caller may proceed. Returns `true` when the caller
    /// was admitted as the half-open probe.
    fn admit(&self) -> Result<bool> {
        match self.state.load(Ordering::Acquire) {
            CLOSED => Ok(false),
            HALF_OPEN => {
                // The probe slot frees up if its holder was cancelled.
                if self
                    .probe_in_flight
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    Ok(true)
                } else {
                    Err(Error::CircuitOpen)
                }
            }
            _ => {
                let opened = self.opened_at_ms.load(Ordering::Acquire);
                let settle = self.config.open_duration + self.config.half_open_test_delay;
                if self.elapsed_ms() < opened.saturating_add(settle.as_millis() as u64) {
                    return Err(Error::CircuitOpen);
                }
                // Only one caller wins the transition to half-open.
                let _guard = self.transition.lock();
                if self.state.load(Ordering::Acquire) != OPEN {
                    return Err(Error::CircuitOpen);
                }
                self.state.store(HALF_OPEN, Ordering::Release);
                self.probe_in_flight.store(true, Ordering::Release);
                self.successes.store(0, Ordering::Release);
                tracing::info!("circuit breaker half-open, admitting probe");
                Ok(true)
            }
        }
    }

    fn on_success(&self, probing: bool) {
        self.successes.fetch_add(1, Ordering::AcqRel);
        if probing {
            let _guard = self.transition.lock();
            self.state.store(CLOSED, Ordering::Release);
            self.failures.store(0, Ordering::Release);
            self.probe_in_flight.store(false, Ordering::Release);
            tracing::info!("circuit breaker closed after successful probe");
        } else if self.state.load(Ordering::Acquire) == CLOSED {
            self.failures.store(0, Ordering::Release);
        }
    }

    fn on_failure(&self, probing: bool) {
        let now = self.elapsed_ms();
        self.last_failure_ms.store(now.max(1), Ordering::Release);

        if probing {
            let _guard = self.transition.lock();
            self.state.store(OPEN, Ordering::Release);
            self.opened_at_ms.store(now.max(1), Ordering::Release);
            self.probe_in_flight.store(false, Ordering::Release);
            tracing::warn!("circuit breaker re-opened after failed probe");
            return;
        }

        let count = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        if count < self.config.failure_threshold {
            return;
        }
        let _guard = self.transition.lock();
        // Re-check under the lock: a concurrent success may have reset the
        // counter, and a concurrent failure may already have opened us.
        if self.state.load(Ordering::Acquire) != CLOSED {
            return;
        }
        if self.failures.load(Ordering::Acquire) < self.config.failure_threshold {
            return;
        }
        self.state.store(OPEN, Ordering::Release);
        self.opened_at_ms.store(now.max(1), Ordering::Release);
        tracing::warn!(failures = count, "circuit breaker opened");
    }

    fn elapsed_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}
