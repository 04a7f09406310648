//! Bounded exponential-backoff retries
//!
//! The delay after failed attempt `n` (0-based) is
//! `min(base_delay * multiplier^n, max_delay)`. With the defaults the schedule
//! is `[1000, 1500, 2250, 3375, 5062]` ms. Jitter is off unless configured.
//!
//! Non-retryable errors (see [`GateError::is_retryable`]) end the loop at once
//! and are returned unchanged. A circuit-open rejection in particular never
//! consumes retry budget.

use crate::error::{GateError, GateResult};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            multiplier: 1.5,
            max_delay: Duration::from_millis(30000),
            jitter: false,
        }
    }
}

impl From<&crate::config::ResilienceSection> for RetryPolicy {
    fn from(section: &crate::config::ResilienceSection) -> Self {
        Self {
            max_attempts: section.max_retries,
            base_delay: Duration::from_millis(section.base_delay_ms),
            multiplier: section.backoff_multiplier,
            max_delay: Duration::from_millis(section.max_delay_ms),
            jitter: section.jitter,
        }
    }
}

impl RetryPolicy {
    /// Deterministic delay after failed attempt `attempt` (0-based), whole ms
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as f64;
        let raw = base * self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let capped = raw.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.floor() as u64)
    }

    /// One delay per attempt
    pub fn delay_schedule(&self) -> Vec<Duration> {
        (0..self.max_attempts).map(|n| self.delay_for(n)).collect()
    }

    /// Delay actually slept; jitter keeps between half and all of it
    fn effective_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        if !self.jitter {
            return delay;
        }
        let factor = 0.5 + rand::random::<f64>() * 0.5;
        Duration::from_millis((delay.as_millis() as f64 * factor) as u64)
    }
}

/// What happened on one attempt
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Succeeded,
    /// Failed; `next_delay` is `None` when no further attempt follows
    Failed {
        error: String,
        next_delay: Option<Duration>,
    },
}

/// Per-attempt notification
#[derive(Debug, Clone, PartialEq)]
pub struct RetryEvent {
    pub context: String,
    /// 1-based attempt number
    pub attempt: u32,
    pub max_attempts: u32,
    pub outcome: AttemptOutcome,
}

pub type RetryObserver = Arc<dyn Fn(&RetryEvent) + Send + Sync>;

#[derive(Clone)]
pub struct RetryManager {
    policy: RetryPolicy,
    observer: Option<RetryObserver>,
}

impl fmt::Debug for RetryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryManager")
            .field("policy", &self.policy)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl RetryManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: RetryObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn notify(&self, event: RetryEvent) {
        if let Some(observer) = &self.observer {
            observer(&event);
        }
    }

    /// Retry `operation` without external cancellation
    pub async fn execute_with_retry<T, F, Fut>(&self, context: &str, operation: F) -> GateResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GateResult<T>>,
    {
        let (_keep, shutdown_rx) = watch::channel(false);
        self.execute_cancellable(context, shutdown_rx, operation).await
    }

    /// Retry `operation`, abandoning the loop (including an in-flight
    /// attempt) as soon as `shutdown` turns true
    pub async fn execute_cancellable<T, F, Fut>(
        &self,
        context: &str,
        mut shutdown: watch::Receiver<bool>,
        mut operation: F,
    ) -> GateResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GateResult<T>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 0..max_attempts {
            if *shutdown.borrow() {
                return Err(GateError::cancelled(context));
            }

            let result = tokio::select! {
                result = operation() => result,
                _ = wait_for_shutdown(&mut shutdown) => {
                    debug!(context, attempt = attempt + 1, "Attempt abandoned on shutdown");
                    return Err(GateError::cancelled(context));
                }
            };

            let err = match result {
                Ok(value) => {
                    self.notify(RetryEvent {
                        context: context.to_string(),
                        attempt: attempt + 1,
                        max_attempts,
                        outcome: AttemptOutcome::Succeeded,
                    });
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                self.notify(RetryEvent {
                    context: context.to_string(),
                    attempt: attempt + 1,
                    max_attempts,
                    outcome: AttemptOutcome::Failed {
                        error: err.to_string(),
                        next_delay: None,
                    },
                });
                debug!(context, error = %err, "Non-retryable error, giving up");
                return Err(err);
            }

            last_error = err.to_string();
            let is_last = attempt + 1 >= max_attempts;
            let delay = (!is_last).then(|| self.policy.effective_delay(attempt));

            self.notify(RetryEvent {
                context: context.to_string(),
                attempt: attempt + 1,
                max_attempts,
                outcome: AttemptOutcome::Failed {
                    error: last_error.clone(),
                    next_delay: delay,
                },
            });

            if let Some(delay) = delay {
                warn!(
                    context,
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Attempt failed, retrying"
                );
                if !interruptible_sleep(&mut shutdown, delay).await {
                    return Err(GateError::cancelled(context));
                }
            }
        }

        error!(context, attempts = max_attempts, error = %last_error, "Retries exhausted");
        Err(GateError::ExhaustedRetries {
            context: context.to_string(),
            attempts: max_attempts,
            last_error,
        })
    }
}

/// Resolves once `shutdown` reads true; never resolves if the sender is gone
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Sleep unless shutdown is signalled first. Returns false on shutdown.
pub async fn interruptible_sleep(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = wait_for_shutdown(shutdown) => false,
    }
}
