//! Command codes and wire payloads
//!
//! The controller understands single-character command codes on the command
//! topic. The HTTP proxy wraps the same code in a JSON publish request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Commands a user can issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// Open/close toggle
    Toggle,
    Auto,
    Garage,
    Stop,
}

impl CommandKind {
    /// Fixed controller code for this command
    pub fn code(&self) -> &'static str {
        match self {
            CommandKind::Toggle => "1",
            CommandKind::Auto => "2",
            CommandKind::Garage => "3",
            CommandKind::Stop => "6",
        }
    }

    /// Action label recorded with proxy publishes
    pub fn label(&self) -> &'static str {
        match self {
            CommandKind::Toggle => "Brána",
            CommandKind::Auto => "Automat",
            CommandKind::Garage => "Garáž",
            CommandKind::Stop => "STOP režim",
        }
    }

    /// Permission required to issue this command
    pub fn permission(&self) -> Permission {
        match self {
            CommandKind::Toggle | CommandKind::Auto => Permission::Gate,
            CommandKind::Garage => Permission::Garage,
            CommandKind::Stop => Permission::Stop,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandKind::Toggle => "toggle",
            CommandKind::Auto => "auto",
            CommandKind::Garage => "garage",
            CommandKind::Stop => "stop",
        };
        f.write_str(name)
    }
}

impl FromStr for CommandKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "toggle" | "1" => Ok(CommandKind::Toggle),
            "auto" | "2" => Ok(CommandKind::Auto),
            "garage" | "3" => Ok(CommandKind::Garage),
            "stop" | "6" => Ok(CommandKind::Stop),
            other => Err(format!("unknown command '{other}'")),
        }
    }
}

/// Capability checked before a command leaves the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Gate,
    Garage,
    Stop,
}

/// A command ready to hand to a transport
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub kind: CommandKind,
    /// Display name of whoever issued the command
    pub actor: String,
    pub issued_at: DateTime<Utc>,
}

impl Command {
    pub fn new(kind: CommandKind, actor: impl Into<String>) -> Self {
        Self {
            kind,
            actor: actor.into(),
            issued_at: Utc::now(),
        }
    }

    /// Payload published on the command topic
    pub fn payload(&self) -> &'static str {
        self.kind.code()
    }

    /// Body posted to the proxy's publish endpoint
    pub fn to_proxy_request(&self, topic: &str) -> ProxyPublishRequest {
        ProxyPublishRequest {
            topic: topic.to_string(),
            message: self.kind.code().to_string(),
            user: format!("ID:{}", self.actor.trim()),
            action: self.kind.label().to_string(),
            timestamp: self.issued_at,
        }
    }
}

/// `POST /mqtt-publish` body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyPublishRequest {
    pub topic: String,
    pub message: String,
    pub user: String,
    pub action: String,
    pub timestamp: DateTime<Utc>,
}

/// `GET /mqtt-status` response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProxyStatusResponse {
    pub connected: bool,
    #[serde(default)]
    pub messages: HashMap<String, String>,
}

/// Where an external log entry came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    External,
}

/// Entry received on the activity log topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalLogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub source: LogSource,
}

impl ExternalLogEntry {
    /// Build an entry from a raw log payload; blank payloads carry nothing
    pub fn from_payload(payload: &str, timestamp: DateTime<Utc>) -> Option<Self> {
        let id = payload.trim();
        if id.is_empty() {
            return None;
        }
        Some(Self {
            id: id.to_string(),
            timestamp,
            source: LogSource::External,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_codes() {
        assert_eq!(CommandKind::Toggle.code(), "1");
        assert_eq!(CommandKind::Auto.code(), "2");
        assert_eq!(CommandKind::Garage.code(), "3");
        assert_eq!(CommandKind::Stop.code(), "6");
    }

    #[test]
    fn test_command_kind_from_str() {
        assert_eq!("toggle".parse::<CommandKind>(), Ok(CommandKind::Toggle));
        assert_eq!("STOP".parse::<CommandKind>(), Ok(CommandKind::Stop));
        assert_eq!("3".parse::<CommandKind>(), Ok(CommandKind::Garage));
        assert!("open".parse::<CommandKind>().is_err());
    }

    #[test]
    fn test_permissions_per_command() {
        assert_eq!(CommandKind::Toggle.permission(), Permission::Gate);
        assert_eq!(CommandKind::Auto.permission(), Permission::Gate);
        assert_eq!(CommandKind::Garage.permission(), Permission::Garage);
        assert_eq!(CommandKind::Stop.permission(), Permission::Stop);
    }

    #[test]
    fn test_proxy_request_shape() {
        let command = Command::new(CommandKind::Toggle, " 12. alice@example.com ");
        let request = command.to_proxy_request("gate/command");
        assert_eq!(request.topic, "gate/command");
        assert_eq!(request.message, "1");
        assert_eq!(request.user, "ID:12. alice@example.com");
        assert_eq!(request.action, "Brána");

        let json = serde_json::to_value(&request).unwrap();
        for field in ["topic", "message", "user", "action", "timestamp"] {
            assert!(json.get(field).is_some(), "missing {field}");
        }
    }

    #[test]
    fn test_status_response_without_messages() {
        let parsed: ProxyStatusResponse = serde_json::from_str(r#"{"connected":false}"#).unwrap();
        assert!(!parsed.connected);
        assert!(parsed.messages.is_empty());
    }

    #[test]
    fn test_external_log_entry_trims_and_skips_blank() {
        let now = Utc::now();
        let entry = ExternalLogEntry::from_payload("  42  ", now).unwrap();
        assert_eq!(entry.id, "42");
        assert_eq!(entry.source, LogSource::External);
        assert!(ExternalLogEntry::from_payload("   ", now).is_none());
    }
}
