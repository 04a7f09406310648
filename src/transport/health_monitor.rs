//! Liveness probe and rolling latency over the active transport
//!
//! The probe runs on its own interval task and reports a [`HealthEvent`] only
//! when liveness flips, never on every tick. Latencies are recorded by the
//! caller (publish round trips) into a bounded window whose mean feeds
//! [`assess_quality`].

use super::{AbortOnDrop, SharedTransport, TransportId};
use crate::config::HealthSection;
use crate::protocol::ConnectionQuality;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Mean latency under which a healthy direct session counts as excellent
pub const EXCELLENT_LATENCY_MS: f64 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthEvent {
    pub origin: TransportId,
    pub transition: HealthTransition,
}

/// Decide whether a probe result is a transition (pure function)
pub fn liveness_transition(previously_alive: bool, alive: bool) -> Option<HealthTransition> {
    match (previously_alive, alive) {
        (false, true) => Some(HealthTransition::Healthy),
        (true, false) => Some(HealthTransition::Unhealthy),
        _ => None,
    }
}

/// Quality of a direct session from health and mean latency (pure function)
pub fn assess_quality(
    healthy: bool,
    mean_latency_ms: Option<f64>,
    degraded_latency_ms: u64,
) -> ConnectionQuality {
    if !healthy {
        return ConnectionQuality::Poor;
    }
    match mean_latency_ms {
        None => ConnectionQuality::Excellent,
        Some(ms) if ms < EXCELLENT_LATENCY_MS => ConnectionQuality::Excellent,
        Some(ms) if ms < degraded_latency_ms as f64 => ConnectionQuality::Good,
        Some(_) => ConnectionQuality::Poor,
    }
}

/// Fixed-size window of the most recent latency samples
#[derive(Debug, Clone)]
pub struct LatencyWindow {
    capacity: usize,
    samples: VecDeque<u64>,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    pub fn record(&mut self, latency_ms: u64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(latency_ms);
    }

    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let total: u64 = self.samples.iter().sum();
        Some(total as f64 / self.samples.len() as f64)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

#[derive(Debug)]
pub struct HealthMonitor {
    interval: Duration,
    latencies: Mutex<LatencyWindow>,
    probe: Mutex<Option<AbortOnDrop>>,
}

impl HealthMonitor {
    pub fn new(interval: Duration, latency_window: usize) -> Self {
        Self {
            interval,
            latencies: Mutex::new(LatencyWindow::new(latency_window)),
            probe: Mutex::new(None),
        }
    }

    pub fn from_config(section: &HealthSection) -> Self {
        Self::new(
            Duration::from_millis(section.probe_interval_ms),
            section.latency_window,
        )
    }

    fn latencies(&self) -> std::sync::MutexGuard<'_, LatencyWindow> {
        self.latencies.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record_latency(&self, latency: Duration) {
        self.latencies().record(latency.as_millis() as u64);
    }

    pub fn mean_latency_ms(&self) -> Option<f64> {
        self.latencies().mean()
    }

    pub fn is_running(&self) -> bool {
        self.probe
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Start probing `transport`, replacing any previous probe. The latency
    /// window starts empty for the new transport.
    pub fn start(&self, transport: SharedTransport, events: mpsc::UnboundedSender<HealthEvent>) {
        self.latencies().clear();

        let interval = self.interval;
        let origin = transport.id();
        let mut alive = transport.is_alive();
        let task = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

            loop {
                ticker.tick().await;
                let now_alive = transport.is_alive();
                if let Some(transition) = liveness_transition(alive, now_alive) {
                    match transition {
                        HealthTransition::Healthy => {
                            info!(transport = %origin, "Transport healthy again")
                        }
                        HealthTransition::Unhealthy => {
                            warn!(transport = %origin, "Transport failed liveness probe")
                        }
                    }
                    if events.send(HealthEvent { origin, transition }).is_err() {
                        break;
                    }
                }
                alive = now_alive;
            }
        });

        *self.probe.lock().unwrap_or_else(|e| e.into_inner()) = Some(AbortOnDrop(task));
    }

    pub fn stop(&self) {
        self.probe.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}
