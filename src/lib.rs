//! gatelink
//!
//! Client for a gate and garage controller reached over MQTT, with an HTTP
//! polling proxy as fallback when the broker cannot be reached directly.
//!
//! # Overview
//!
//! - [`protocol`]: status payload parsing, topics, command codes
//! - [`resilience`]: retry with backoff, circuit breaker, request cache
//! - [`transport`]: direct broker and HTTP proxy transports, connection
//!   pool, health monitor
//! - [`messaging`]: the [`MessagingClient`] orchestrating all of the above
//! - [`automaton`]: auto-close countdown and open confirmation for the gate
//! - [`observability`]: logging, connection metrics, status server
//!
//! # Quick Start
//!
//! ```no_run
//! use gatelink::{CommandKind, GateConfig, MessagingClient};
//!
//! # async fn example() -> gatelink::GateResult<()> {
//! let config = GateConfig::for_broker("mqtt://broker.local:1883");
//! let client = MessagingClient::new(&config);
//!
//! client.on_status_change(|status| println!("gate is {}", status.gate_state));
//! client.connect().await?;
//! client.publish_command(CommandKind::Toggle, "Anna").await?;
//! # Ok(())
//! # }
//! ```

pub mod automaton;
pub mod clock;
pub mod config;
pub mod error;
pub mod messaging;
pub mod observability;
pub mod protocol;
pub mod resilience;
pub mod testing;
pub mod transport;

pub use automaton::{GateAutomaton, GateAutomationState, Notice};
pub use config::{ConfigError, GateConfig, TransportPreference};
pub use error::{GateError, GateResult};
pub use messaging::MessagingClient;
pub use observability::ConnectionMetrics;
pub use protocol::*;
