//! Mock implementations for testing
//!
//! Provides a recording [`MockTransport`], a [`MockConnector`] that hands
//! them out and a [`RecordingPublisher`] for the automaton, so pool, client
//! and automaton logic can be exercised without a broker or proxy.

use crate::automaton::CommandPublisher;
use crate::error::{GateError, GateResult};
use crate::protocol::{Command, CommandKind, TransportKind};
use crate::transport::{
    emit, Connector, EventSender, SharedTransport, Transport, TransportEvent, TransportId,
    Visibility,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Mock transport for testing
#[derive(Debug)]
pub struct MockTransport {
    id: TransportId,
    kind: TransportKind,
    endpoint: String,
    events: EventSender,
    alive: AtomicBool,
    should_fail: AtomicBool,
    publish_delay: Mutex<Duration>,
    published: Mutex<Vec<Command>>,
    visibility_changes: Mutex<Vec<Visibility>>,
    refresh_requests: AtomicU32,
    shutdown_calls: AtomicU32,
}

impl MockTransport {
    pub fn new(kind: TransportKind, endpoint: impl Into<String>, events: EventSender) -> Self {
        Self::with_id(TransportId::next(), kind, endpoint, events)
    }

    pub fn with_id(
        id: TransportId,
        kind: TransportKind,
        endpoint: impl Into<String>,
        events: EventSender,
    ) -> Self {
        Self {
            id,
            kind,
            endpoint: endpoint.into(),
            events,
            alive: AtomicBool::new(true),
            should_fail: AtomicBool::new(false),
            publish_delay: Mutex::new(Duration::ZERO),
            published: Mutex::new(Vec::new()),
            visibility_changes: Mutex::new(Vec::new()),
            refresh_requests: AtomicU32::new(0),
            shutdown_calls: AtomicU32::new(0),
        }
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    /// Make every publish fail with a transient error
    pub fn set_should_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_publish_delay(&self, delay: Duration) {
        *self.publish_delay.lock().unwrap() = delay;
    }

    /// Push an event into the client as if the transport observed it
    pub fn emit(&self, event: TransportEvent) {
        emit(&self.events, self.id, event);
    }

    pub fn emit_message(&self, topic: &str, payload: &str) {
        self.emit(TransportEvent::Message {
            topic: topic.to_string(),
            payload: payload.to_string(),
        });
    }

    pub fn published(&self) -> Vec<Command> {
        self.published.lock().unwrap().clone()
    }

    pub fn visibility_changes(&self) -> Vec<Visibility> {
        self.visibility_changes.lock().unwrap().clone()
    }

    pub fn refresh_count(&self) -> u32 {
        self.refresh_requests.load(Ordering::SeqCst)
    }

    pub fn shutdown_count(&self) -> u32 {
        self.shutdown_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn publish_command(&self, command: &Command) -> GateResult<()> {
        let delay = *self.publish_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(GateError::transient("Mock publish failure"));
        }
        self.published.lock().unwrap().push(command.clone());
        Ok(())
    }

    async fn shutdown(&self) {
        self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
    }

    fn set_visibility(&self, visibility: Visibility) {
        self.visibility_changes.lock().unwrap().push(visibility);
    }

    fn request_refresh(&self) {
        self.refresh_requests.fetch_add(1, Ordering::SeqCst);
    }
}

/// Connector handing out [`MockTransport`]s and remembering each one
#[derive(Debug)]
pub struct MockConnector {
    kind: TransportKind,
    endpoint: String,
    failures_left: AtomicU32,
    connect_delay: Mutex<Duration>,
    connects: AtomicU32,
    created: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockConnector {
    pub fn new(kind: TransportKind, endpoint: impl Into<String>) -> Self {
        Self {
            kind,
            endpoint: endpoint.into(),
            failures_left: AtomicU32::new(0),
            connect_delay: Mutex::new(Duration::ZERO),
            connects: AtomicU32::new(0),
            created: Mutex::new(Vec::new()),
        }
    }

    /// Fail the next `n` connect attempts with a transient error
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock().unwrap() = delay;
    }

    /// Connect attempts, failed ones included
    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    /// Transports created so far, oldest first
    pub fn transports(&self) -> Vec<Arc<MockTransport>> {
        self.created.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<Arc<MockTransport>> {
        self.created.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    async fn connect(&self, id: TransportId, events: EventSender) -> GateResult<SharedTransport> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        let delay = *self.connect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(GateError::transient(format!(
                "Mock connect to {} refused",
                self.endpoint
            )));
        }

        let transport = Arc::new(MockTransport::with_id(
            id,
            self.kind,
            self.endpoint.clone(),
            events,
        ));
        self.created.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}

/// Command publisher that records calls instead of sending them
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    calls: Mutex<Vec<(CommandKind, String)>>,
    should_fail: AtomicBool,
    delay: Mutex<Duration>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_should_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> Vec<(CommandKind, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandPublisher for RecordingPublisher {
    async fn publish(&self, kind: CommandKind, actor: &str) -> GateResult<()> {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(GateError::NotConnected);
        }
        self.calls.lock().unwrap().push((kind, actor.to_string()));
        Ok(())
    }
}
