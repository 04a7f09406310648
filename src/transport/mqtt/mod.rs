//! Direct MQTT transport
//!
//! Split the same way as the rest of the transport layer: pure pieces are
//! separate from the I/O so they can be tested without a broker.
//!
//! - [`connection`] - broker URL parsing, session options, last will, session state
//! - [`message_handler`] - MQTT event routing and subscription QoS
//! - [`client`] - the [`DirectTransport`] and its session supervisor
//!
//! # Usage
//!
//! ```rust,no_run
//! use gatelink::config::GateConfig;
//! use gatelink::protocol::{Command, CommandKind};
//! use gatelink::transport::{Connector, MqttConnector, TransportId};
//!
//! # tokio_test::block_on(async {
//! let config = GateConfig::for_broker("mqtt://localhost:1883");
//! let connector = MqttConnector::new(config.mqtt.clone(), "panel", config.connect_timeout());
//!
//! let (events, _rx) = tokio::sync::mpsc::unbounded_channel();
//! let transport = connector.connect(TransportId::next(), events).await?;
//! transport.publish_command(&Command::new(CommandKind::Toggle, "Anna")).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::DirectTransport;
pub use connection::{configure_mqtt_options, parse_broker_url, ConnectionState};
pub use message_handler::{route_mqtt_event, EventRoute};

use super::{Connector, EventSender, SharedTransport, TransportId};
use crate::config::MqttSection;
use crate::error::GateResult;
use crate::protocol::TransportKind;
use std::sync::Arc;
use std::time::Duration;

/// Connects [`DirectTransport`]s to the configured broker
#[derive(Debug, Clone)]
pub struct MqttConnector {
    config: MqttSection,
    client_id: String,
    connect_timeout: Duration,
}

impl MqttConnector {
    pub fn new(config: MqttSection, client_id: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            config,
            client_id: client_id.into(),
            connect_timeout,
        }
    }
}

#[async_trait::async_trait]
impl Connector for MqttConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }

    fn endpoint(&self) -> String {
        self.config.broker_url.clone().unwrap_or_default()
    }

    async fn connect(&self, id: TransportId, events: EventSender) -> GateResult<SharedTransport> {
        let transport = DirectTransport::connect(
            id,
            &self.config,
            &self.client_id,
            events,
            self.connect_timeout,
        )
        .await?;
        Ok(Arc::new(transport))
    }
}
