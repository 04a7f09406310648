//! Failure isolation around transport operations
//!
//! - [`circuit_breaker`] stops calling a known-failing operation for a cooldown
//! - [`retry`] retries transient failures with bounded exponential backoff
//! - [`cache`] memoizes successful polled reads for a short TTL

pub mod cache;
pub mod circuit_breaker;
pub mod retry;

pub use cache::RequestCache;
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitState,
};
pub use retry::{
    interruptible_sleep, wait_for_shutdown, AttemptOutcome, RetryEvent, RetryManager,
    RetryObserver, RetryPolicy,
};
