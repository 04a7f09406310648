//! Pure session state and option building for the direct MQTT transport
//!
//! Nothing here touches the network: broker URL parsing, session ids, the
//! last-will payload, and the session state machine driven by the event loop
//! in [`super::client`].

use crate::config::MqttSection;
use crate::error::{GateError, GateResult};
use chrono::{DateTime, Utc};
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::{mqttbytes::QoS, MqttOptions};
use rumqttc::Transport as RumqttcTransport;
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

/// Reason published in the last-will message
pub const WILL_REASON: &str = "client_disconnect";

/// Session state of the direct transport
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Waiting for the first ConnAck
    Connecting,
    Connected,
    Disconnected(String),
    /// Transport-internal reconnect (attempt count)
    Reconnecting(u32),
}

impl ConnectionState {
    pub fn can_publish(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// What the event loop observed
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ConnAckReceived,
    DisconnectedByBroker,
    NetworkError(String),
    ReconnectStarted(u32),
}

/// Next session state after `event` (pure function)
pub fn next_state(current: &ConnectionState, event: SessionEvent) -> ConnectionState {
    let next = match event {
        SessionEvent::ConnAckReceived => ConnectionState::Connected,
        SessionEvent::DisconnectedByBroker => {
            ConnectionState::Disconnected("Broker disconnected".to_string())
        }
        SessionEvent::NetworkError(error) => ConnectionState::Disconnected(error),
        SessionEvent::ReconnectStarted(attempt) => ConnectionState::Reconnecting(attempt),
    };
    log_state_transition(current, &next);
    next
}

fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
    match (from, to) {
        (ConnectionState::Connecting, ConnectionState::Connected) => {
            info!("MQTT session established")
        }
        (ConnectionState::Reconnecting(attempt), ConnectionState::Connected) => {
            info!(attempt, "MQTT session restored")
        }
        (ConnectionState::Connected, ConnectionState::Disconnected(reason)) => {
            warn!(%reason, "MQTT session lost")
        }
        _ => {}
    }
}

/// Host, port and TLS flag from a broker URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// Parse `mqtt://`, `tcp://`, `mqtts://` or `ssl://` broker URLs
pub fn parse_broker_url(broker_url: &str) -> GateResult<BrokerAddress> {
    let url =
        Url::parse(broker_url).map_err(|_| GateError::InvalidBrokerUrl(broker_url.to_string()))?;

    let tls = match url.scheme() {
        "mqtts" | "ssl" => true,
        "mqtt" | "tcp" => false,
        _ => return Err(GateError::InvalidBrokerUrl(broker_url.to_string())),
    };
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| GateError::InvalidBrokerUrl(broker_url.to_string()))?;
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    Ok(BrokerAddress {
        host: host.to_string(),
        port,
        tls,
    })
}

/// Broker session id: configured client id plus a random suffix so two
/// processes sharing a config do not kick each other off the broker
pub fn session_client_id(client_id: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{client_id}-{}", &suffix[..8])
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WillPayload<'a> {
    client_id: &'a str,
    timestamp: DateTime<Utc>,
    reason: &'static str,
}

/// Last-will body: `{clientId, timestamp, reason}`
pub fn will_payload(session_id: &str, timestamp: DateTime<Utc>) -> GateResult<String> {
    Ok(serde_json::to_string(&WillPayload {
        client_id: session_id,
        timestamp,
        reason: WILL_REASON,
    })?)
}

/// Build session options from config (pure apart from reading credentials)
pub fn configure_mqtt_options(session_id: &str, config: &MqttSection) -> GateResult<MqttOptions> {
    let broker_url = config
        .broker_url
        .as_deref()
        .ok_or_else(|| GateError::InvalidBrokerUrl(String::new()))?;
    let address = parse_broker_url(broker_url)?;

    let mut mqtt_options = MqttOptions::new(session_id, address.host, address.port);
    if address.tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(username) = config.username() {
        let password = config.password().unwrap_or_default();
        mqtt_options.set_credentials(username, password);
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));

    // Peers learn about ungraceful disconnects from the will; it is not
    // retained so a later subscriber does not see a stale disconnect.
    let will = LastWill::new(
        &config.will_topic,
        will_payload(session_id, Utc::now())?,
        QoS::AtLeastOnce,
        false,
        None,
    );
    mqtt_options.set_last_will(will);

    Ok(mqtt_options)
}
