//! Connection metrics
//!
//! Counters use atomics; the running averages share one mutex so a snapshot
//! never pairs a new total with a stale mean. Counters only ever grow: there
//! is no reset short of dropping the recorder.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Immutable metrics snapshot handed to callers and listeners
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub connection_attempts: u64,
    pub successful_connections: u64,
    pub failed_connections: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub total_latency_ms: u64,
    pub average_latency_ms: f64,
    pub average_connection_time_ms: f64,
    pub last_connection_time: Option<DateTime<Utc>>,
}

impl ConnectionMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.connection_attempts == 0 {
            return 0.0;
        }
        self.successful_connections as f64 / self.connection_attempts as f64
    }
}

#[derive(Debug, Default)]
struct Averages {
    total_latency_ms: u64,
    latency_samples: u64,
    average_latency_ms: f64,
    average_connection_time_ms: f64,
    last_connection_time: Option<DateTime<Utc>>,
}

/// Incremental mean: `mean + (sample - mean) / n`
fn running_mean(mean: f64, sample: f64, n: u64) -> f64 {
    if n == 0 {
        return mean;
    }
    mean + (sample - mean) / n as f64
}

/// Records connection and message activity for one messaging client
#[derive(Debug, Default)]
pub struct MetricsRecorder {
    connection_attempts: AtomicU64,
    successful_connections: AtomicU64,
    failed_connections: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    averages: Mutex<Averages>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn averages(&self) -> std::sync::MutexGuard<'_, Averages> {
        self.averages.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// A connect attempt succeeded after `elapsed`
    pub fn connection_succeeded(&self, elapsed: Duration, at: DateTime<Utc>) {
        let n = self.successful_connections.fetch_add(1, Ordering::Relaxed) + 1;
        let mut averages = self.averages();
        averages.average_connection_time_ms = running_mean(
            averages.average_connection_time_ms,
            elapsed.as_secs_f64() * 1000.0,
            n,
        );
        averages.last_connection_time = Some(at);
    }

    pub fn connection_failed(&self) {
        self.failed_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// A command left the client; `latency` is the publish round trip
    pub fn message_sent(&self, latency: Duration) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    fn record_latency(&self, latency: Duration) {
        let mut averages = self.averages();
        let ms = latency.as_millis() as u64;
        averages.total_latency_ms = averages.total_latency_ms.saturating_add(ms);
        averages.latency_samples += 1;
        averages.average_latency_ms =
            running_mean(averages.average_latency_ms, ms as f64, averages.latency_samples);
    }

    pub fn snapshot(&self) -> ConnectionMetrics {
        let averages = self.averages();
        ConnectionMetrics {
            connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
            successful_connections: self.successful_connections.load(Ordering::Relaxed),
            failed_connections: self.failed_connections.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            total_latency_ms: averages.total_latency_ms,
            average_latency_ms: averages.average_latency_ms,
            average_connection_time_ms: averages.average_connection_time_ms,
            last_connection_time: averages.last_connection_time,
        }
    }
}
