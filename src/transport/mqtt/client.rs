//! Direct MQTT transport: I/O and the session supervisor
//!
//! `connect` only returns once the broker has acknowledged the session and
//! every subscription. After that the supervisor task owns the event loop:
//! it forwards payloads as [`TransportEvent::Message`], reports session loss
//! as `Offline`, retries every `reconnect_period_ms`, and on a restored
//! session resubscribes and reports `Online`.

use super::connection::{
    configure_mqtt_options, next_state, session_client_id, ConnectionState, SessionEvent,
};
use super::message_handler::{
    command_publication, route_mqtt_event, subscription_plan, EventRoute,
};
use crate::config::MqttSection;
use crate::error::{GateError, GateResult};
use crate::protocol::{Command, TopicSet, TransportKind};
use crate::resilience::{interruptible_sleep, wait_for_shutdown};
use crate::transport::{
    emit, AbortOnDrop, EventSender, Transport, TransportEvent, TransportId,
};
use rumqttc::v5::{AsyncClient, EventLoop};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct DirectTransport {
    id: TransportId,
    endpoint: String,
    session_id: String,
    client: AsyncClient,
    topics: TopicSet,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    supervisor: Mutex<Option<AbortOnDrop>>,
    closed: AtomicBool,
}

impl DirectTransport {
    /// Open a session, wait for ConnAck, then subscribe to the status and
    /// log topics. Any failure tears the half-open session down.
    pub async fn connect(
        id: TransportId,
        config: &MqttSection,
        client_id: &str,
        events: EventSender,
        timeout: Duration,
    ) -> GateResult<Self> {
        let endpoint = config.broker_url.clone().unwrap_or_default();
        let session_id = session_client_id(client_id);
        let options = configure_mqtt_options(&session_id, config)?;
        let topics = config.topics();

        let (client, event_loop) = AsyncClient::new(options, 10);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (suback_tx, mut suback_rx) = mpsc::unbounded_channel();

        let supervisor = SessionSupervisor {
            origin: id,
            client: client.clone(),
            topics: topics.clone(),
            state_tx,
            events,
            suback_tx,
            reconnect_period: Duration::from_millis(config.reconnect_period_ms),
        };
        let guard = AbortOnDrop(tokio::spawn(supervisor.run(event_loop, shutdown_rx)));

        info!(transport = %id, endpoint = %endpoint, session = %session_id, "Connecting to broker");
        wait_for_connection_confirmation(state_rx.clone(), timeout, &endpoint).await?;
        subscribe_all(&client, &topics, &mut suback_rx, timeout).await?;
        info!(transport = %id, endpoint = %endpoint, "Broker session ready");

        Ok(Self {
            id,
            endpoint,
            session_id,
            client,
            topics,
            state_rx,
            shutdown_tx,
            supervisor: Mutex::new(Some(guard)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }
}

/// Wait until the session is acknowledged or refused
pub(crate) async fn wait_for_connection_confirmation(
    mut state_rx: watch::Receiver<ConnectionState>,
    timeout: Duration,
    endpoint: &str,
) -> GateResult<()> {
    let settled = tokio::time::timeout(
        timeout,
        state_rx.wait_for(|state| {
            matches!(
                state,
                ConnectionState::Connected | ConnectionState::Disconnected(_)
            )
        }),
    )
    .await;

    let state = match settled {
        Err(_) => {
            return Err(GateError::connect_timeout(
                endpoint,
                timeout.as_millis() as u64,
            ))
        }
        Ok(Err(_)) => return Err(GateError::transient("Session state channel closed")),
        Ok(Ok(state)) => state.clone(),
    };

    match state {
        ConnectionState::Connected => Ok(()),
        ConnectionState::Disconnected(reason) => Err(GateError::transient(format!(
            "Connection to {endpoint} failed: {reason}"
        ))),
        other => Err(GateError::transient(format!(
            "Unexpected session state {other:?}"
        ))),
    }
}

/// Subscribe to every topic and wait for each SubAck in order
async fn subscribe_all(
    client: &AsyncClient,
    topics: &TopicSet,
    suback_rx: &mut mpsc::UnboundedReceiver<Vec<String>>,
    timeout: Duration,
) -> GateResult<()> {
    let plan = subscription_plan(topics);
    for (topic, qos) in &plan {
        client
            .subscribe(topic.clone(), *qos)
            .await
            .map_err(|e| GateError::subscription(topic, e.to_string()))?;
    }

    for (topic, _) in &plan {
        match tokio::time::timeout(timeout, suback_rx.recv()).await {
            Ok(Some(failures)) if failures.is_empty() => {
                debug!(topic = %topic, "Subscription confirmed");
            }
            Ok(Some(failures)) => {
                return Err(GateError::subscription(
                    topic,
                    format!("broker refused subscription: {}", failures.join(", ")),
                ))
            }
            Ok(None) => return Err(GateError::subscription(topic, "session closed")),
            Err(_) => return Err(GateError::subscription(topic, "no SubAck received")),
        }
    }
    Ok(())
}

/// Owns the rumqttc event loop for one transport
struct SessionSupervisor {
    origin: TransportId,
    client: AsyncClient,
    topics: TopicSet,
    state_tx: watch::Sender<ConnectionState>,
    events: EventSender,
    suback_tx: mpsc::UnboundedSender<Vec<String>>,
    reconnect_period: Duration,
}

impl SessionSupervisor {
    fn transition(&self, event: SessionEvent) -> ConnectionState {
        let current = self.state_tx.borrow().clone();
        let next = next_state(&current, event);
        self.state_tx.send_replace(next.clone());
        next
    }

    async fn resubscribe(&self) {
        for (topic, qos) in subscription_plan(&self.topics) {
            if let Err(e) = self.client.subscribe(topic.clone(), qos).await {
                warn!(transport = %self.origin, topic = %topic, error = %e, "Resubscribe failed");
            }
        }
    }

    async fn run(self, mut event_loop: EventLoop, mut shutdown_rx: watch::Receiver<bool>) {
        let mut session_established = false;
        let mut reconnect_attempts = 0u32;

        loop {
            let polled = tokio::select! {
                _ = wait_for_shutdown(&mut shutdown_rx) => break,
                polled = event_loop.poll() => polled,
            };

            match polled {
                Ok(event) => match route_mqtt_event(&event) {
                    EventRoute::ConnectionAcknowledged => {
                        self.transition(SessionEvent::ConnAckReceived);
                        if session_established {
                            reconnect_attempts = 0;
                            self.resubscribe().await;
                            emit(&self.events, self.origin, TransportEvent::Online);
                        }
                        session_established = true;
                    }
                    EventRoute::MessageReceived { topic, payload } => {
                        debug!(transport = %self.origin, topic = %topic, "Message received");
                        emit(
                            &self.events,
                            self.origin,
                            TransportEvent::Message { topic, payload },
                        );
                    }
                    EventRoute::Disconnected => {
                        self.transition(SessionEvent::DisconnectedByBroker);
                        emit(
                            &self.events,
                            self.origin,
                            TransportEvent::Offline {
                                reason: "Broker disconnected".to_string(),
                            },
                        );
                    }
                    EventRoute::SubscriptionAcknowledged { failures } => {
                        if !failures.is_empty() {
                            warn!(transport = %self.origin, ?failures, "Broker refused subscription");
                        }
                        let _ = self.suback_tx.send(failures);
                    }
                    EventRoute::InfrastructureEvent(detail) => {
                        debug!(transport = %self.origin, %detail, "MQTT event");
                    }
                    EventRoute::OutgoingEvent => {}
                },
                Err(e) => {
                    let reason = e.to_string();
                    let was_connected = self.state_tx.borrow().can_publish();
                    self.transition(SessionEvent::NetworkError(reason.clone()));
                    if was_connected {
                        emit(
                            &self.events,
                            self.origin,
                            TransportEvent::Offline { reason },
                        );
                    }
                    if session_established {
                        reconnect_attempts += 1;
                        self.transition(SessionEvent::ReconnectStarted(reconnect_attempts));
                        emit(
                            &self.events,
                            self.origin,
                            TransportEvent::Reconnecting {
                                attempt: reconnect_attempts,
                            },
                        );
                    }
                    if !interruptible_sleep(&mut shutdown_rx, self.reconnect_period).await {
                        break;
                    }
                }
            }
        }
        debug!(transport = %self.origin, "Session supervisor stopped");
    }
}

#[async_trait::async_trait]
impl Transport for DirectTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.state_rx.borrow().can_publish()
    }

    async fn publish_command(&self, command: &Command) -> GateResult<()> {
        if !self.is_alive() {
            return Err(GateError::NotConnected);
        }

        let (topic, qos, payload) = command_publication(&self.topics, command);
        self.client
            .publish(topic, qos, false, payload)
            .await
            .map_err(|e| {
                GateError::transient(format!("Publish to {} failed: {e}", self.topics.command))
            })?;

        debug!(transport = %self.id, command = %command.kind, actor = %command.actor, "Command published");
        Ok(())
    }

    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.client.disconnect().await {
            debug!(transport = %self.id, error = %e, "Disconnect request not delivered");
        }

        let guard = self
            .supervisor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut guard) = guard {
            // Remaining work is aborted when the guard drops
            if tokio::time::timeout(Duration::from_secs(2), &mut guard.0)
                .await
                .is_err()
            {
                warn!(transport = %self.id, "Session supervisor did not stop in time, aborting");
            }
        }
        info!(transport = %self.id, endpoint = %self.endpoint, "Direct transport shut down");
    }
}
