//! Transport layer between the messaging client and the gate controller
//!
//! Two transports exist: a direct MQTT session ([`mqtt`]) and an HTTP polling
//! proxy ([`http_proxy`]). Both implement [`Transport`] and report everything
//! they observe as [`TransportEvent`]s tagged with their [`TransportId`], so the
//! client can drop events from a transport it has already replaced.
//!
//! Handles are cached by [`pool::ConnectionPool`] and watched by
//! [`health_monitor::HealthMonitor`].

use crate::error::GateResult;
use crate::protocol::{Command, ConnectionQuality, TransportKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

pub mod health_monitor;
pub mod http_proxy;
pub mod mqtt;
pub mod pool;

pub use health_monitor::{assess_quality, HealthEvent, HealthMonitor, HealthTransition};
pub use http_proxy::{HttpProxyConnector, HttpProxyTransport};
pub use mqtt::{DirectTransport, MqttConnector};
pub use pool::{ConnectionPool, PoolKey};

/// Identity of one transport instance for the lifetime of the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportId(u64);

impl TransportId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Whether the hosting application is in the foreground
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Foreground,
    Background,
}

/// Something a transport observed
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Payload received on a subscribed topic
    Message { topic: String, payload: String },
    /// Session (re)established
    Online,
    /// Session lost; the transport may still recover on its own
    Offline { reason: String },
    /// Transport-internal reconnect in progress
    Reconnecting { attempt: u32 },
    /// Transport-specific quality estimate changed
    Quality(ConnectionQuality),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportEnvelope {
    pub origin: TransportId,
    pub event: TransportEvent,
}

pub type EventSender = mpsc::UnboundedSender<TransportEnvelope>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEnvelope>;

/// Send an event, ignoring a receiver that has already gone away
pub(crate) fn emit(events: &EventSender, origin: TransportId, event: TransportEvent) {
    let _ = events.send(TransportEnvelope { origin, event });
}

/// A live connection to the gate controller
#[async_trait::async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    fn id(&self) -> TransportId;

    fn kind(&self) -> TransportKind;

    fn endpoint(&self) -> &str;

    /// Connected and not in the middle of a transport-internal reconnect
    fn is_alive(&self) -> bool;

    /// Publish a single command
    async fn publish_command(&self, command: &Command) -> GateResult<()>;

    /// Release the connection. Safe to call more than once.
    async fn shutdown(&self);

    fn set_visibility(&self, _visibility: Visibility) {}

    /// Ask for fresh status outside the regular schedule
    fn request_refresh(&self) {}
}

pub type SharedTransport = Arc<dyn Transport>;

/// Establishes transports of one kind against one endpoint
#[async_trait::async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    fn kind(&self) -> TransportKind;

    fn endpoint(&self) -> String;

    async fn connect(&self, id: TransportId, events: EventSender) -> GateResult<SharedTransport>;
}

/// Aborts the wrapped task when dropped
#[derive(Debug)]
pub(crate) struct AbortOnDrop(pub tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}
