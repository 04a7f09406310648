//! The messaging client
//!
//! Owns the device status and the connection metrics, picks a transport,
//! and routes commands through retry, the circuit breaker and the active
//! transport. Transport and health events arrive on channels and are folded
//! into state by a single pump task, so status updates are applied in the
//! order the transports produced them.

use super::access::{PermissionTable, SharedAuthorizer};
use super::listeners::{ListenerId, Listeners};
use crate::clock::{SharedClock, TokioClock};
use crate::config::{GateConfig, TransportPreference};
use crate::error::{GateError, GateResult};
use crate::observability::metrics::{ConnectionMetrics, MetricsRecorder};
use crate::protocol::{
    parse_garage_code, parse_gate_code, Command, CommandKind, ConnectionQuality, DeviceStatus,
    ExternalLogEntry, TopicKind, TopicSet, TransportKind,
};
use crate::resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, RetryManager, RetryPolicy,
};
use crate::transport::{
    assess_quality, AbortOnDrop, Connector, ConnectionPool, EventReceiver, EventSender,
    HealthEvent, HealthMonitor, HealthTransition, HttpProxyConnector, MqttConnector,
    SharedTransport, TransportEnvelope, TransportEvent, TransportId, Visibility,
};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn, Instrument};

/// Name of the breaker wrapping connects and publishes
pub const CLIENT_BREAKER_NAME: &str = "messaging";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug)]
struct ClientState {
    phase: Phase,
    active: Option<SharedTransport>,
    /// Events from transports older than this are stale
    floor: Option<TransportId>,
    /// Bumped by every disconnect so an in-flight connect knows it lost
    generation: u64,
    /// Cancels retry loops of the current session
    session_cancel: Option<watch::Sender<bool>>,
    visibility: Visibility,
    healthy: bool,
    transport_quality: Option<ConnectionQuality>,
}

impl ClientState {
    fn is_stale(&self, origin: TransportId) -> bool {
        self.floor.is_some_and(|floor| origin < floor)
    }

    fn is_active(&self, origin: TransportId) -> bool {
        self.active.as_ref().is_some_and(|t| t.id() == origin)
    }

    fn active_kind(&self) -> TransportKind {
        self.active
            .as_ref()
            .map(|t| t.kind())
            .unwrap_or(TransportKind::None)
    }

    /// Forget the active transport and ignore anything it still sends
    fn retire_all(&mut self) -> Option<SharedTransport> {
        self.floor = Some(TransportId::next());
        self.healthy = true;
        self.transport_quality = None;
        self.active.take()
    }
}

/// Quality for the status snapshot. `connected == false` is clamped later by
/// [`DeviceStatus::normalized`].
pub fn derive_quality(
    kind: TransportKind,
    transport_quality: Option<ConnectionQuality>,
    healthy: bool,
    mean_latency_ms: Option<f64>,
    degraded_latency_ms: u64,
) -> ConnectionQuality {
    match kind {
        TransportKind::None => ConnectionQuality::Disconnected,
        TransportKind::HttpProxy if !healthy => ConnectionQuality::Poor,
        TransportKind::HttpProxy => transport_quality.unwrap_or(ConnectionQuality::Good),
        TransportKind::Direct => assess_quality(healthy, mean_latency_ms, degraded_latency_ms),
    }
}

/// Connectors for the configured endpoints, in the order they are tried
pub fn connectors_for(config: &GateConfig, clock: SharedClock) -> Vec<Arc<dyn Connector>> {
    let direct = config.mqtt.broker_url.as_ref().map(|_| {
        Arc::new(MqttConnector::new(
            config.mqtt.clone(),
            config.client.id.clone(),
            config.connect_timeout(),
        )) as Arc<dyn Connector>
    });
    let proxy = config.proxy.base_url.as_ref().map(|_| {
        Arc::new(HttpProxyConnector::new(
            config.proxy.clone(),
            config.mqtt.topics(),
            CircuitBreakerConfig::from(&config.resilience),
            clock.clone(),
        )) as Arc<dyn Connector>
    });

    match config.client.transport {
        TransportPreference::Auto => direct.into_iter().chain(proxy).collect(),
        TransportPreference::Direct => direct.into_iter().collect(),
        TransportPreference::HttpProxy => proxy.into_iter().collect(),
    }
}

#[derive(Debug)]
struct ClientInner {
    client_id: String,
    topics: TopicSet,
    degraded_latency_ms: u64,
    connectors: Vec<Arc<dyn Connector>>,
    pool: ConnectionPool,
    health: HealthMonitor,
    retry: RetryManager,
    breaker: CircuitBreaker,
    authorizer: SharedAuthorizer,
    clock: SharedClock,
    metrics: MetricsRecorder,
    events_tx: EventSender,
    health_tx: mpsc::UnboundedSender<HealthEvent>,
    state: Mutex<ClientState>,
    status_tx: watch::Sender<DeviceStatus>,
    status_listeners: Listeners<DeviceStatus>,
    metrics_listeners: Listeners<ConnectionMetrics>,
    log_listeners: Listeners<ExternalLogEntry>,
    pump: Mutex<Option<AbortOnDrop>>,
}

/// Resilient client for the gate controller. Cheap to clone; clones share
/// one connection and one status.
#[derive(Debug, Clone)]
pub struct MessagingClient {
    inner: Arc<ClientInner>,
}

impl MessagingClient {
    /// Client for the endpoints in `config`. Must be called inside a tokio
    /// runtime.
    pub fn new(config: &GateConfig) -> Self {
        let clock: SharedClock = Arc::new(TokioClock);
        let connectors = connectors_for(config, clock.clone());
        let authorizer = Arc::new(PermissionTable::new(config.access.clone()));
        Self::with_parts(config, connectors, authorizer, clock)
    }

    /// Client over explicit connectors, authorizer and clock
    pub fn with_parts(
        config: &GateConfig,
        connectors: Vec<Arc<dyn Connector>>,
        authorizer: SharedAuthorizer,
        clock: SharedClock,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (health_tx, health_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(DeviceStatus::disconnected());

        let inner = Arc::new(ClientInner {
            client_id: config.client.id.clone(),
            topics: config.mqtt.topics(),
            degraded_latency_ms: config.health.degraded_latency_ms,
            connectors,
            pool: ConnectionPool::from_config(&config.pool),
            health: HealthMonitor::from_config(&config.health),
            retry: RetryManager::new(RetryPolicy::from(&config.resilience)),
            breaker: CircuitBreaker::new(
                CLIENT_BREAKER_NAME,
                CircuitBreakerConfig::from(&config.resilience),
                clock.clone(),
            ),
            authorizer,
            clock,
            metrics: MetricsRecorder::new(),
            events_tx,
            health_tx,
            state: Mutex::new(ClientState {
                phase: Phase::Disconnected,
                active: None,
                floor: None,
                generation: 0,
                session_cancel: None,
                visibility: Visibility::Foreground,
                healthy: true,
                transport_quality: None,
            }),
            status_tx,
            status_listeners: Listeners::new("status"),
            metrics_listeners: Listeners::new("metrics"),
            log_listeners: Listeners::new("external_log"),
            pump: Mutex::new(None),
        });

        let pump = tokio::spawn(run_pump(Arc::downgrade(&inner), events_rx, health_rx));
        *inner.pump.lock().unwrap_or_else(|e| e.into_inner()) = Some(AbortOnDrop(pump));

        Self { inner }
    }

    /// Connect through the first connector that succeeds, retrying the whole
    /// selection with backoff. A no-op while a live transport is active.
    pub async fn connect(&self) -> GateResult<()> {
        let inner = &self.inner;
        let (generation, cancel_rx, stale) = {
            let mut state = inner.state();
            match state.phase {
                Phase::Connecting => return Err(GateError::ConnectionInProgress),
                Phase::Connected if state.active.as_ref().is_some_and(|t| t.is_alive()) => {
                    debug!("Already connected");
                    return Ok(());
                }
                _ => {}
            }
            state.phase = Phase::Connecting;
            let stale = state.retire_all();
            let (cancel_tx, cancel_rx) = watch::channel(false);
            state.session_cancel = Some(cancel_tx);
            (state.generation, cancel_rx, stale)
        };

        if let Some(stale) = stale {
            info!(transport = %stale.id(), "Replacing dead transport");
            inner.health.stop();
            inner.pool.release(&stale).await;
        }

        if inner.connectors.is_empty() {
            inner.state().phase = Phase::Disconnected;
            return Err(GateError::Config(crate::config::ConfigError::InvalidConfig(
                "no transport endpoint configured".to_string(),
            )));
        }

        let started = inner.clock.now();
        let result = inner
            .retry
            .execute_cancellable("Connect", cancel_rx, || inner.connect_once())
            .instrument(crate::connect_span!(client_id = %inner.client_id, generation))
            .await;

        match result {
            Ok(transport) => {
                if inner.state().generation != generation {
                    info!(transport = %transport.id(), "Disconnected while connecting, dropping transport");
                    inner.pool.release(&transport).await;
                    return Err(GateError::cancelled("Connect"));
                }
                inner.activate(transport, inner.clock.now().duration_since(started));
                Ok(())
            }
            Err(err) => {
                let current = {
                    let mut state = inner.state();
                    let current = state.generation == generation;
                    if current {
                        state.phase = Phase::Disconnected;
                    }
                    current
                };
                warn!(error = %err, "Connect failed");
                if current {
                    let message = err.user_message();
                    inner.update_status(|status| {
                        status.connected = false;
                        status.transport = TransportKind::None;
                        status.last_error = Some(message);
                    });
                }
                Err(err)
            }
        }
    }

    /// Drop the connection, cancel retry loops and reset the status. Safe to
    /// call in any state, including during `connect`.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        let (cancel, active, was) = {
            let mut state = inner.state();
            state.generation += 1;
            let was = std::mem::replace(&mut state.phase, Phase::Disconnected);
            (state.session_cancel.take(), state.retire_all(), was)
        };

        if let Some(cancel) = cancel {
            let _ = cancel.send(true);
        }
        inner.health.stop();
        inner.pool.release_all().await;
        if let Some(active) = active {
            active.shutdown().await;
        }
        inner.update_status(|status| *status = DeviceStatus::disconnected());

        if was != Phase::Disconnected {
            info!("Disconnected");
        }
    }

    /// Publish `kind` on behalf of `actor`
    pub async fn publish_command(&self, kind: CommandKind, actor: &str) -> GateResult<()> {
        let inner = &self.inner;
        if !inner.authorizer.may_issue(actor, kind) {
            warn!(actor, command = %kind, "Command rejected by access table");
            return Err(GateError::Unauthorized {
                actor: actor.to_string(),
                command: kind.to_string(),
            });
        }

        let mut command = Command::new(kind, actor);
        command.issued_at = inner.clock.wall();
        inner
            .send_command(command)
            .instrument(crate::command_span!(command = %kind, actor))
            .await
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn get_status(&self) -> DeviceStatus {
        self.inner.status_tx.borrow().clone()
    }

    /// Receiver that always holds the latest status
    pub fn subscribe_status(&self) -> watch::Receiver<DeviceStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn get_metrics(&self) -> ConnectionMetrics {
        self.inner.metrics.snapshot()
    }

    pub fn breaker_snapshot(&self) -> CircuitBreakerSnapshot {
        self.inner.breaker.snapshot()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.status_tx.borrow().connected
    }

    pub fn on_status_change<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&DeviceStatus) + Send + Sync + 'static,
    {
        self.inner.status_listeners.subscribe(callback)
    }

    pub fn on_metrics_change<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&ConnectionMetrics) + Send + Sync + 'static,
    {
        self.inner.metrics_listeners.subscribe(callback)
    }

    pub fn on_external_log<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&ExternalLogEntry) + Send + Sync + 'static,
    {
        self.inner.log_listeners.subscribe(callback)
    }

    /// Remove a listener registered with any of the `on_*` methods
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.inner.status_listeners.unsubscribe(id)
            || self.inner.metrics_listeners.unsubscribe(id)
            || self.inner.log_listeners.unsubscribe(id)
    }

    /// Forward the host's visibility to the active transport, and remember it
    /// for transports connected later
    pub fn set_visibility(&self, visibility: Visibility) {
        let active = {
            let mut state = self.inner.state();
            state.visibility = visibility;
            state.active.clone()
        };
        if let Some(transport) = active {
            transport.set_visibility(visibility);
        }
    }

    /// Ask the active transport for fresh status
    pub fn refresh_status(&self) {
        let active = self.inner.state().active.clone();
        match active {
            Some(transport) => transport.request_refresh(),
            None => debug!("Refresh requested without an active transport"),
        }
    }
}

impl ClientInner {
    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// One pass over the connectors; the first success wins
    async fn connect_once(&self) -> GateResult<SharedTransport> {
        self.metrics.connection_attempt();
        self.publish_metrics();

        let mut last_error = None;
        for connector in &self.connectors {
            let endpoint = connector.endpoint();
            let attempt = self
                .breaker
                .execute(|| {
                    self.pool.get_connection(
                        connector.as_ref(),
                        &self.client_id,
                        self.events_tx.clone(),
                    )
                })
                .await;

            match attempt {
                Ok(transport) => return Ok(transport),
                Err(err) => {
                    warn!(kind = %connector.kind(), endpoint = %endpoint, error = %err, "Transport unavailable");
                    last_error = Some(err);
                }
            }
        }

        self.metrics.connection_failed();
        self.publish_metrics();
        Err(last_error.unwrap_or(GateError::NotConnected))
    }

    fn activate(&self, transport: SharedTransport, elapsed: Duration) {
        let visibility = {
            let mut state = self.state();
            state.phase = Phase::Connected;
            state.active = Some(transport.clone());
            state.healthy = true;
            state.transport_quality = None;
            state.visibility
        };
        if visibility != Visibility::Foreground {
            transport.set_visibility(visibility);
        }
        self.health.start(transport.clone(), self.health_tx.clone());

        self.metrics.connection_succeeded(elapsed, self.clock.wall());
        self.publish_metrics();

        let alive = transport.is_alive();
        let kind = transport.kind();
        let quality = self.current_quality();
        self.update_status(|status| {
            status.connected = alive;
            status.transport = kind;
            status.connection_quality = quality;
            status.last_error = None;
        });
        info!(
            transport = %transport.id(),
            kind = %kind,
            endpoint = %transport.endpoint(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Connected"
        );
    }

    async fn send_command(&self, command: Command) -> GateResult<()> {
        let (transport, cancel_rx) = {
            let state = self.state();
            match (&state.phase, &state.active, &state.session_cancel) {
                (Phase::Connected, Some(transport), Some(cancel)) => {
                    (transport.clone(), cancel.subscribe())
                }
                _ => return Err(GateError::NotConnected),
            }
        };

        let context = format!("Publish {}", command.kind);
        let result = self
            .retry
            .execute_cancellable(&context, cancel_rx, || async {
                let started = self.clock.now();
                self.breaker
                    .execute(|| transport.publish_command(&command))
                    .await?;
                Ok::<_, GateError>(self.clock.now().duration_since(started))
            })
            .await;

        match result {
            Ok(latency) => {
                self.metrics.message_sent(latency);
                self.health.record_latency(latency);
                self.publish_metrics();
                let quality = self.current_quality();
                self.update_status(|status| {
                    status.latency_ms = Some(latency.as_millis() as u64);
                    status.connection_quality = quality;
                });
                info!(command = %command.kind, actor = %command.actor, latency_ms = latency.as_millis() as u64, "Command published");
                Ok(())
            }
            Err(GateError::ExhaustedRetries {
                context,
                attempts,
                last_error,
            }) => {
                let err = GateError::PublishFailed {
                    context,
                    attempts,
                    last_error,
                };
                let message = err.user_message();
                self.update_status(|status| status.last_error = Some(message));
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    fn current_quality(&self) -> ConnectionQuality {
        let (kind, transport_quality, healthy) = {
            let state = self.state();
            (state.active_kind(), state.transport_quality, state.healthy)
        };
        derive_quality(
            kind,
            transport_quality,
            healthy,
            self.health.mean_latency_ms(),
            self.degraded_latency_ms,
        )
    }

    /// Replace the status with an edited copy; listeners hear about real
    /// changes only
    fn update_status(&self, edit: impl FnOnce(&mut DeviceStatus)) {
        let mut changed = None;
        self.status_tx.send_if_modified(|current| {
            let mut next = current.clone();
            edit(&mut next);
            let next = next.normalized();
            if next == *current {
                return false;
            }
            *current = next.clone();
            changed = Some(next);
            true
        });
        if let Some(status) = changed {
            self.status_listeners.notify(&status);
        }
    }

    fn publish_metrics(&self) {
        self.metrics_listeners.notify(&self.metrics.snapshot());
    }

    fn handle_transport_event(&self, envelope: TransportEnvelope) {
        let TransportEnvelope { origin, event } = envelope;
        let active = {
            let state = self.state();
            if state.is_stale(origin) {
                debug!(transport = %origin, ?event, "Ignoring event from retired transport");
                return;
            }
            state.is_active(origin)
        };

        match event {
            TransportEvent::Message { topic, payload } => {
                self.metrics.message_received();
                self.publish_metrics();
                self.handle_message(&topic, &payload);
            }
            // Session state only matters for the transport in use; a transport
            // still connecting reports it through `connect`
            _ if !active => {
                debug!(transport = %origin, ?event, "Ignoring session event from inactive transport");
            }
            TransportEvent::Online => {
                info!(transport = %origin, "Transport online");
                let quality = self.current_quality();
                self.update_status(|status| {
                    status.connected = true;
                    status.connection_quality = quality;
                    status.last_error = None;
                });
            }
            TransportEvent::Offline { reason } => {
                warn!(transport = %origin, reason = %reason, "Transport offline");
                self.update_status(|status| {
                    status.connected = false;
                    status.last_error = Some(reason);
                });
            }
            TransportEvent::Reconnecting { attempt } => {
                info!(transport = %origin, attempt, "Transport reconnecting");
                self.update_status(|status| {
                    status.connected = false;
                    status.last_error = Some(format!("Reconnecting (attempt {attempt})"));
                });
            }
            TransportEvent::Quality(quality) => {
                self.state().transport_quality = Some(quality);
                let quality = self.current_quality();
                self.update_status(|status| status.connection_quality = quality);
            }
        }
    }

    fn handle_message(&self, topic: &str, payload: &str) {
        match self.topics.classify(topic) {
            TopicKind::GateStatus => {
                let gate_state = parse_gate_code(payload);
                debug!(payload, state = %gate_state, "Gate status received");
                self.update_status(|status| status.gate_state = gate_state);
            }
            TopicKind::GarageStatus => {
                let garage_state = parse_garage_code(payload);
                debug!(payload, state = %garage_state, "Garage status received");
                self.update_status(|status| status.garage_state = garage_state);
            }
            TopicKind::ExternalLog => {
                if let Some(entry) = ExternalLogEntry::from_payload(payload, self.clock.wall()) {
                    self.log_listeners.notify(&entry);
                }
            }
            TopicKind::Other => debug!(topic, "Message on unexpected topic"),
        }
    }

    fn handle_health_event(&self, event: HealthEvent) {
        {
            let mut state = self.state();
            if !state.is_active(event.origin) {
                return;
            }
            state.healthy = event.transition == HealthTransition::Healthy;
        }
        let quality = self.current_quality();
        self.update_status(|status| status.connection_quality = quality);
    }
}

/// Folds transport and health events into client state until the client is
/// dropped
async fn run_pump(
    inner: Weak<ClientInner>,
    mut events: EventReceiver,
    mut health: mpsc::UnboundedReceiver<HealthEvent>,
) {
    loop {
        tokio::select! {
            Some(envelope) = events.recv() => {
                let Some(inner) = inner.upgrade() else { break };
                inner.handle_transport_event(envelope);
            }
            Some(event) = health.recv() => {
                let Some(inner) = inner.upgrade() else { break };
                inner.handle_health_event(event);
            }
            else => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_quality_follows_health_and_latency() {
        let q = |healthy, mean| derive_quality(TransportKind::Direct, None, healthy, mean, 3000);
        assert_eq!(q(true, None), ConnectionQuality::Excellent);
        assert_eq!(q(true, Some(1500.0)), ConnectionQuality::Good);
        assert_eq!(q(true, Some(3500.0)), ConnectionQuality::Poor);
        assert_eq!(q(false, Some(10.0)), ConnectionQuality::Poor);
    }

    #[test]
    fn test_direct_quality_at_degraded_boundary() {
        let q = |mean, degraded| {
            derive_quality(TransportKind::Direct, None, true, Some(mean), degraded)
        };
        assert_eq!(q(999.9, 3000), ConnectionQuality::Excellent);
        assert_eq!(q(1000.0, 3000), ConnectionQuality::Good);
        assert_eq!(q(2999.9, 3000), ConnectionQuality::Good);
        assert_eq!(q(3000.0, 3000), ConnectionQuality::Poor);
        assert_eq!(q(1200.0, 1200), ConnectionQuality::Poor);
    }

    #[test]
    fn test_proxy_quality_comes_from_transport() {
        let q = |reported, healthy| {
            derive_quality(TransportKind::HttpProxy, reported, healthy, Some(10.0), 3000)
        };
        assert_eq!(q(None, true), ConnectionQuality::Good);
        assert_eq!(q(Some(ConnectionQuality::Excellent), true), ConnectionQuality::Excellent);
        assert_eq!(q(Some(ConnectionQuality::Excellent), false), ConnectionQuality::Poor);
    }

    #[test]
    fn test_no_transport_is_disconnected() {
        assert_eq!(
            derive_quality(TransportKind::None, None, true, None, 3000),
            ConnectionQuality::Disconnected
        );
    }

    #[test]
    fn test_connectors_follow_preference() {
        let clock: SharedClock = Arc::new(TokioClock);
        let mut config = GateConfig::default();
        config.mqtt.broker_url = Some("mqtt://broker:1883".to_string());
        config.proxy.base_url = Some("https://proxy.example/api".to_string());

        let kinds = |config: &GateConfig| {
            connectors_for(config, clock.clone())
                .iter()
                .map(|c| c.kind())
                .collect::<Vec<_>>()
        };
        assert_eq!(
            kinds(&config),
            vec![TransportKind::Direct, TransportKind::HttpProxy]
        );

        config.client.transport = TransportPreference::HttpProxy;
        assert_eq!(kinds(&config), vec![TransportKind::HttpProxy]);

        config.client.transport = TransportPreference::Direct;
        config.mqtt.broker_url = None;
        assert!(kinds(&config).is_empty());
    }
}
