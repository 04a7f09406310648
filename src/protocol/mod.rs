//! Gate controller wire protocol
//!
//! Typed device status, topic names, command codes and the JSON bodies used by
//! the HTTP proxy.

pub mod command;
pub mod status;
pub mod topics;

pub use command::{
    Command, CommandKind, ExternalLogEntry, LogSource, Permission, ProxyPublishRequest,
    ProxyStatusResponse,
};
pub use status::{
    parse_garage_code, parse_gate_code, ConnectionQuality, DeviceStatus, GarageState, GateState,
    TransportKind,
};
pub use topics::{canonicalize_topic, TopicKind, TopicSet};
