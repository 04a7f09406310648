//! Pure polling bookkeeping for the HTTP proxy transport
//!
//! [`PollScheduler`] decides when the next poll runs and coalesces ticks
//! that arrive while a poll is in flight. [`StatusDiff`] turns successive
//! proxy snapshots into transport events, and [`ProxyStats`] derives the
//! connection quality from request outcomes.

use crate::protocol::{ConnectionQuality, ProxyStatusResponse, TopicSet};
use crate::transport::{TransportEvent, Visibility};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

/// Delay of the follow-up poll owed to a coalesced tick
pub const FOLLOW_UP_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct PollScheduler {
    foreground: Duration,
    background: Duration,
    visibility: Visibility,
    in_flight: bool,
    pending: bool,
}

impl PollScheduler {
    pub fn new(foreground: Duration, background: Duration) -> Self {
        Self {
            foreground,
            background,
            visibility: Visibility::Foreground,
            in_flight: false,
            pending: false,
        }
    }

    /// Regular interval for the current visibility
    pub fn interval(&self) -> Duration {
        match self.visibility {
            Visibility::Foreground => self.foreground,
            Visibility::Background => self.background,
        }
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    pub fn is_polling(&self) -> bool {
        self.in_flight
    }

    /// Called when a poll is due. Returns false if one is already in flight;
    /// the tick is then remembered and owed as a follow-up.
    pub fn begin_poll(&mut self) -> bool {
        if self.in_flight {
            self.pending = true;
            return false;
        }
        self.in_flight = true;
        self.pending = false;
        true
    }

    /// Called when the in-flight poll finished. Returns the delay until the
    /// next poll.
    pub fn finish_poll(&mut self) -> Duration {
        self.in_flight = false;
        if std::mem::take(&mut self.pending) {
            FOLLOW_UP_DELAY
        } else {
            self.interval()
        }
    }

    /// Visibility changed. Returns the delay until the next poll: immediately
    /// when coming to the foreground, the background interval otherwise.
    pub fn set_visibility(&mut self, visibility: Visibility) -> Duration {
        self.visibility = visibility;
        match visibility {
            Visibility::Foreground => Duration::ZERO,
            Visibility::Background => self.background,
        }
    }
}

/// Remembers the last proxy snapshot and reports what changed
#[derive(Debug, Clone, Default)]
pub struct StatusDiff {
    connected: Option<bool>,
    payloads: HashMap<String, String>,
}

impl StatusDiff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events for one snapshot. The first snapshot reports every watched
    /// payload it carries; later ones only report payloads that changed.
    pub fn apply(&mut self, response: &ProxyStatusResponse, topics: &TopicSet) -> Vec<TransportEvent> {
        let mut events = Vec::new();

        if self.connected != Some(response.connected) {
            events.push(if response.connected {
                TransportEvent::Online
            } else {
                TransportEvent::Offline {
                    reason: "Proxy reports broker disconnected".to_string(),
                }
            });
            self.connected = Some(response.connected);
        }

        for topic in topics.subscriptions() {
            let Some(payload) = response.messages.get(topic) else {
                continue;
            };
            if self.payloads.get(topic) == Some(payload) {
                continue;
            }
            self.payloads.insert(topic.to_string(), payload.clone());
            events.push(TransportEvent::Message {
                topic: topic.to_string(),
                payload: payload.clone(),
            });
        }

        events
    }

    /// The proxy could not be reached. Reports `Offline` once.
    pub fn mark_unreachable(&mut self, reason: &str) -> Option<TransportEvent> {
        if self.connected == Some(false) {
            return None;
        }
        self.connected = Some(false);
        Some(TransportEvent::Offline {
            reason: reason.to_string(),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected == Some(true)
    }
}

/// Request statistics for the proxy connection
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProxyStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Mean duration of successful requests
    pub average_response_ms: f64,
    pub last_request_at: Option<DateTime<Utc>>,
}

impl ProxyStats {
    pub fn record_success(&mut self, elapsed: Duration, at: DateTime<Utc>) {
        self.total_requests += 1;
        self.successful_requests += 1;
        let n = self.successful_requests as f64;
        let ms = elapsed.as_secs_f64() * 1000.0;
        self.average_response_ms += (ms - self.average_response_ms) / n;
        self.last_request_at = Some(at);
    }

    pub fn record_failure(&mut self, at: DateTime<Utc>) {
        self.total_requests += 1;
        self.failed_requests += 1;
        self.last_request_at = Some(at);
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.successful_requests as f64 / self.total_requests as f64
    }

    pub fn quality(&self) -> ConnectionQuality {
        let rate = self.success_rate();
        let avg = self.average_response_ms;
        if rate >= 0.95 && avg < 1000.0 {
            ConnectionQuality::Excellent
        } else if rate >= 0.85 && avg < 3000.0 {
            ConnectionQuality::Good
        } else if rate >= 0.7 {
            ConnectionQuality::Poor
        } else {
            ConnectionQuality::Disconnected
        }
    }
}
