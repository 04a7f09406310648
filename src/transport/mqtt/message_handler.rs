//! Pure routing of MQTT events for the direct transport

use crate::protocol::{Command, TopicSet};
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::{mqttbytes::QoS, Event};

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Session established or restored
    ConnectionAcknowledged,
    /// Payload on a subscribed topic
    MessageReceived { topic: String, payload: String },
    /// Broker sent DISCONNECT
    Disconnected,
    /// SubAck with the reason codes that indicate failure, if any
    SubscriptionAcknowledged { failures: Vec<String> },
    InfrastructureEvent(String),
    OutgoingEvent,
}

/// Route an MQTT event (pure routing decision)
pub fn route_mqtt_event(event: &Event) -> EventRoute {
    match event {
        Event::Incoming(incoming) => match incoming {
            Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
            Packet::Publish(publish) => EventRoute::MessageReceived {
                topic: String::from_utf8_lossy(&publish.topic).to_string(),
                payload: String::from_utf8_lossy(&publish.payload).to_string(),
            },
            Packet::Disconnect(_) => EventRoute::Disconnected,
            Packet::SubAck(suback) => EventRoute::SubscriptionAcknowledged {
                failures: suback
                    .return_codes
                    .iter()
                    .map(|code| format!("{code:?}"))
                    .filter(|code| is_failure_code(code))
                    .collect(),
            },
            other => EventRoute::InfrastructureEvent(format!("{other:?}")),
        },
        Event::Outgoing(_) => EventRoute::OutgoingEvent,
    }
}

/// Whether a rendered SubAck reason code means the subscription was refused.
/// Granted subscriptions render as their QoS (`Success(AtMostOnce)`, `QoS1`).
pub fn is_failure_code(code: &str) -> bool {
    !(code.starts_with("Success") || code.starts_with("QoS"))
}

/// Delivery level for a subscription: log entries must not be dropped,
/// status topics only ever matter for their latest value
pub fn subscription_qos(topics: &TopicSet, topic: &str) -> QoS {
    if topic == topics.log {
        QoS::AtLeastOnce
    } else {
        QoS::AtMostOnce
    }
}

/// Subscriptions issued on every (re)connect
pub fn subscription_plan(topics: &TopicSet) -> Vec<(String, QoS)> {
    topics
        .subscriptions()
        .iter()
        .map(|topic| (topic.to_string(), subscription_qos(topics, topic)))
        .collect()
}

/// Where and how a command goes out. Only the command topic is written;
/// the controller reports the actor on the log topic itself.
pub fn command_publication(
    topics: &TopicSet,
    command: &Command,
) -> (String, QoS, &'static str) {
    (topics.command.clone(), QoS::AtMostOnce, command.payload())
}
