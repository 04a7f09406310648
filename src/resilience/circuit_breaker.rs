//! Circuit breaker guarding transport operations
//!
//! `Closed -> Open` after `failure_threshold` consecutive failures,
//! `Open -> HalfOpen` once `recovery_timeout` has elapsed since the last
//! failure, `HalfOpen -> Closed` on the next success. A failure while half-open
//! reopens the circuit and restarts the recovery timer.
//!
//! Half-open admits a single trial call; others are rejected until it
//! resolves. A trial that never reports back is replaced after another
//! `recovery_timeout`.

use crate::clock::SharedClock;
use crate::error::{GateError, GateResult};
use serde::Serialize;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_millis(60000),
        }
    }
}

impl From<&crate::config::ResilienceSection> for CircuitBreakerConfig {
    fn from(section: &crate::config::ResilienceSection) -> Self {
        Self {
            failure_threshold: section.failure_threshold,
            recovery_timeout: Duration::from_millis(section.recovery_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    /// Start of the outstanding half-open trial
    trial_started_at: Option<Instant>,
}

/// Point-in-time view of a breaker for monitoring
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Time until an open circuit admits a trial call
    pub retry_in_ms: Option<u64>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: SharedClock,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                trial_started_at: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        // State stays consistent across a panicking holder: every update is a
        // plain field store.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current state without triggering the Open -> HalfOpen transition
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let guard = self.lock();
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: guard.state,
            consecutive_failures: guard.consecutive_failures,
            retry_in_ms: match guard.state {
                CircuitState::Open => Some(self.remaining_cooldown(&guard).as_millis() as u64),
                _ => None,
            },
        }
    }

    fn remaining_cooldown(&self, state: &BreakerState) -> Duration {
        match state.last_failure_at {
            Some(at) => {
                let elapsed = self.clock.now().saturating_duration_since(at);
                self.config.recovery_timeout.saturating_sub(elapsed)
            }
            None => Duration::ZERO,
        }
    }

    /// Admit or reject a call. An open circuit whose cooldown has elapsed
    /// moves to half-open and admits the caller as the trial call.
    pub fn try_acquire(&self) -> GateResult<()> {
        let mut guard = self.lock();
        let now = self.clock.now();
        let remaining = match guard.state {
            CircuitState::Closed => return Ok(()),
            CircuitState::Open => self.remaining_cooldown(&guard),
            CircuitState::HalfOpen => match guard.trial_started_at {
                Some(started) => self
                    .config
                    .recovery_timeout
                    .saturating_sub(now.saturating_duration_since(started)),
                None => Duration::ZERO,
            },
        };

        if remaining.is_zero() {
            if guard.state == CircuitState::HalfOpen {
                debug!(breaker = %self.name, "Previous trial call never resolved, admitting another");
            } else {
                info!(breaker = %self.name, "Circuit breaker half-open, admitting trial call");
            }
            guard.state = CircuitState::HalfOpen;
            guard.trial_started_at = Some(now);
            return Ok(());
        }

        debug!(breaker = %self.name, retry_in_ms = remaining.as_millis() as u64, "Circuit open, rejecting call");
        Err(GateError::CircuitOpen {
            name: self.name.clone(),
            retry_in_ms: remaining.as_millis() as u64,
        })
    }

    pub fn record_success(&self) {
        let mut guard = self.lock();
        if guard.state == CircuitState::HalfOpen {
            info!(breaker = %self.name, "Circuit breaker closed after successful trial call");
        }
        guard.state = CircuitState::Closed;
        guard.consecutive_failures = 0;
        guard.trial_started_at = None;
    }

    pub fn record_failure(&self) {
        let mut guard = self.lock();
        guard.trial_started_at = None;
        guard.consecutive_failures = guard.consecutive_failures.saturating_add(1);
        guard.last_failure_at = Some(self.clock.now());

        match guard.state {
            CircuitState::HalfOpen => {
                guard.state = CircuitState::Open;
                warn!(breaker = %self.name, "Trial call failed, circuit breaker reopened");
            }
            CircuitState::Closed if guard.consecutive_failures >= self.config.failure_threshold => {
                guard.state = CircuitState::Open;
                warn!(
                    breaker = %self.name,
                    failures = guard.consecutive_failures,
                    recovery_ms = self.config.recovery_timeout.as_millis() as u64,
                    "Circuit breaker opened"
                );
            }
            _ => {}
        }
    }

    /// Run `operation` through the breaker. Rejected calls never invoke it.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> GateResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GateResult<T>>,
    {
        self.try_acquire()?;

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                // Cancellation says nothing about the remote side
                if matches!(err, GateError::Cancelled { .. }) {
                    self.release_trial();
                } else {
                    self.record_failure();
                }
                Err(err)
            }
        }
    }

    /// Let the next caller take over an unresolved half-open trial
    fn release_trial(&self) {
        self.lock().trial_started_at = None;
    }

    /// Operator override: close the circuit and forget past failures
    pub fn reset(&self) {
        let mut guard = self.lock();
        guard.state = CircuitState::Closed;
        guard.consecutive_failures = 0;
        guard.last_failure_at = None;
        guard.trial_started_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn breaker(clock: &ManualClock) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::default(),
            Arc::new(clock.clone()),
        )
    }

    async fn fail(cb: &CircuitBreaker, calls: &AtomicU32) -> GateResult<()> {
        cb.execute(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(GateError::transient("boom"))
        })
        .await
    }

    async fn succeed(cb: &CircuitBreaker, calls: &AtomicU32) -> GateResult<()> {
        cb.execute(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
    }

    #[tokio::test]
    async fn test_circuit_starts_closed() {
        let clock = ManualClock::new();
        let cb = breaker(&clock);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_circuit_opens_after_threshold_failures() {
        let clock = ManualClock::new();
        let cb = breaker(&clock);
        let calls = AtomicU32::new(0);

        for _ in 0..4 {
            assert!(fail(&cb, &calls).await.is_err());
        }
        assert_eq!(cb.state(), CircuitState::Closed);

        assert!(fail(&cb, &calls).await.is_err());
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        let rejected = succeed(&cb, &calls).await;
        assert!(matches!(rejected, Err(GateError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 5, "operation must not run");
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let clock = ManualClock::new();
        let cb = breaker(&clock);
        let calls = AtomicU32::new(0);

        for _ in 0..4 {
            let _ = fail(&cb, &calls).await;
        }
        succeed(&cb, &calls).await.unwrap();
        assert_eq!(cb.consecutive_failures(), 0);

        for _ in 0..4 {
            let _ = fail(&cb, &calls).await;
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_success_closes() {
        let clock = ManualClock::new();
        let cb = breaker(&clock);
        let calls = AtomicU32::new(0);

        for _ in 0..5 {
            let _ = fail(&cb, &calls).await;
        }
        clock.advance(Duration::from_millis(59_999));
        assert!(succeed(&cb, &calls).await.is_err());

        clock.advance(Duration::from_millis(1));
        succeed(&cb, &calls).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens_and_restarts_timer() {
        let clock = ManualClock::new();
        let cb = breaker(&clock);
        let calls = AtomicU32::new(0);

        for _ in 0..5 {
            let _ = fail(&cb, &calls).await;
        }
        clock.advance(Duration::from_secs(60));
        assert!(cb.try_acquire().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(30));
        let err = cb.try_acquire().unwrap_err();
        match err {
            GateError::CircuitOpen { retry_in_ms, .. } => assert_eq!(retry_in_ms, 30_000),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_half_open_admits_one_trial_at_a_time() {
        let clock = ManualClock::new();
        let cb = breaker(&clock);
        for _ in 0..5 {
            cb.record_failure();
        }
        clock.advance(Duration::from_secs(60));

        assert!(cb.try_acquire().is_ok());
        for _ in 0..3 {
            assert!(matches!(
                cb.try_acquire(),
                Err(GateError::CircuitOpen { .. })
            ));
        }
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
        assert!(cb.try_acquire().is_ok());
    }

    #[tokio::test]
    async fn test_unresolved_trial_is_replaced_after_recovery_timeout() {
        let clock = ManualClock::new();
        let cb = breaker(&clock);
        for _ in 0..5 {
            cb.record_failure();
        }
        clock.advance(Duration::from_secs(60));
        assert!(cb.try_acquire().is_ok());

        clock.advance(Duration::from_secs(59));
        let err = cb.try_acquire().unwrap_err();
        match err {
            GateError::CircuitOpen { retry_in_ms, .. } => assert_eq!(retry_in_ms, 1_000),
            other => panic!("unexpected error {other:?}"),
        }

        clock.advance(Duration::from_secs(1));
        assert!(cb.try_acquire().is_ok());
        assert!(cb.try_acquire().is_err());
    }

    #[tokio::test]
    async fn test_cancelled_trial_frees_the_slot() {
        let clock = ManualClock::new();
        let cb = breaker(&clock);
        for _ in 0..5 {
            cb.record_failure();
        }
        clock.advance(Duration::from_secs(60));

        let cancelled = cb
            .execute(|| async { Err::<(), _>(GateError::cancelled("publish")) })
            .await;
        assert!(matches!(cancelled, Err(GateError::Cancelled { .. })));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let calls = AtomicU32::new(0);
        succeed(&cb, &calls).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_cancellation_does_not_count_as_failure() {
        let clock = ManualClock::new();
        let cb = breaker(&clock);
        for _ in 0..10 {
            let _ = cb
                .execute(|| async { Err::<(), _>(GateError::cancelled("publish")) })
                .await;
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_snapshot_reports_cooldown() {
        let clock = ManualClock::new();
        let cb = breaker(&clock);
        for _ in 0..5 {
            cb.record_failure();
        }
        clock.advance(Duration::from_secs(10));
        let snapshot = cb.snapshot();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.retry_in_ms, Some(50_000));

        cb.reset();
        assert_eq!(cb.snapshot().retry_in_ms, None);
    }
}
