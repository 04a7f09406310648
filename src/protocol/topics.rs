//! Broker topic names
//!
//! Topics are configurable per deployment; [`TopicSet::default`] carries the
//! names the controller ships with.

use serde::{Deserialize, Serialize};

pub const GATE_STATUS_TOPIC: &str = "gate/status";
pub const GARAGE_STATUS_TOPIC: &str = "garage/status";
pub const LOG_TOPIC: &str = "activity/log-id";
pub const COMMAND_TOPIC: &str = "gate/command";
pub const WILL_TOPIC: &str = "activity/disconnect";

/// What a topic carries, from this client's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    GateStatus,
    GarageStatus,
    ExternalLog,
    Other,
}

/// The full set of topics a client talks to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSet {
    pub gate_status: String,
    pub garage_status: String,
    pub log: String,
    pub command: String,
    pub will: String,
}

impl Default for TopicSet {
    fn default() -> Self {
        Self {
            gate_status: GATE_STATUS_TOPIC.to_string(),
            garage_status: GARAGE_STATUS_TOPIC.to_string(),
            log: LOG_TOPIC.to_string(),
            command: COMMAND_TOPIC.to_string(),
            will: WILL_TOPIC.to_string(),
        }
    }
}

impl TopicSet {
    /// Classify an incoming topic
    pub fn classify(&self, topic: &str) -> TopicKind {
        let topic = canonicalize_topic(topic);
        if topic == self.gate_status {
            TopicKind::GateStatus
        } else if topic == self.garage_status {
            TopicKind::GarageStatus
        } else if topic == self.log {
            TopicKind::ExternalLog
        } else {
            TopicKind::Other
        }
    }

    /// Topics subscribed on connect, in subscription order
    pub fn subscriptions(&self) -> [&str; 3] {
        [&self.gate_status, &self.garage_status, &self.log]
    }
}

/// Collapse repeated and trailing slashes. Broker topics here are relative,
/// so a leading slash is kept only when the input had one.
pub fn canonicalize_topic(topic: &str) -> String {
    let leading = topic.starts_with('/');
    let joined = topic
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/");
    if leading {
        format!("/{joined}")
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_classify_default_topics() {
        let topics = TopicSet::default();
        assert_eq!(topics.classify("gate/status"), TopicKind::GateStatus);
        assert_eq!(topics.classify("garage/status"), TopicKind::GarageStatus);
        assert_eq!(topics.classify("activity/log-id"), TopicKind::ExternalLog);
        assert_eq!(topics.classify("gate/command"), TopicKind::Other);
    }

    #[test]
    fn test_classify_tolerates_sloppy_slashes() {
        let topics = TopicSet::default();
        assert_eq!(topics.classify("gate//status/"), TopicKind::GateStatus);
    }

    #[test]
    fn test_subscriptions_order() {
        let topics = TopicSet::default();
        assert_eq!(
            topics.subscriptions(),
            ["gate/status", "garage/status", "activity/log-id"]
        );
    }

    #[test]
    fn test_canonicalize_examples() {
        assert_eq!(canonicalize_topic("gate/status"), "gate/status");
        assert_eq!(canonicalize_topic("gate//status//"), "gate/status");
        assert_eq!(canonicalize_topic("//gate/status"), "/gate/status");
        assert_eq!(canonicalize_topic(""), "");
    }

    proptest! {
        #[test]
        fn canonicalize_topic_is_idempotent(topic in ".*") {
            let first = canonicalize_topic(&topic);
            let second = canonicalize_topic(&first);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn canonicalize_topic_no_consecutive_slashes(topic in "[a-z/]{0,32}") {
            let result = canonicalize_topic(&topic);
            prop_assert!(!result.contains("//"), "{}", result);
            prop_assert!(!result.ends_with('/') || result == "/", "{}", result);
        }
    }
}
